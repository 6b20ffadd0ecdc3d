//! Protocol-level building blocks of the `cqlroute` driver core:
//! frame headers, the incremental frame assembler, wire primitives
//! and the handful of request/response bodies the transport itself needs.

pub mod frame;

pub use crate::frame::assembler::{Frame, FrameAssembler};
pub use crate::frame::header::{FrameHeader, ProtocolVersion};
pub use crate::frame::Compression;
