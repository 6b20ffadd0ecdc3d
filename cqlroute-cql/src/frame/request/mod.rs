//! CQL requests sent by the client.
//!
//! Only the requests the transport itself issues (connection setup and
//! keepalive) are modelled here. Statement requests are serialized by the
//! layer above and framed with [`SerializedRequest::from_body`](super::SerializedRequest::from_body).

use std::borrow::Cow;
use std::collections::HashMap;

use super::frame_errors::CqlRequestSerializationError;
use super::types;
use super::TryFromPrimitiveError;

/* Key names for options in SUPPORTED/STARTUP */
pub const COMPRESSION: &str = "COMPRESSION";
pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";

/* Value names for options in SUPPORTED/STARTUP */
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
pub const DEFAULT_DRIVER_NAME: &str = "cqlroute";
pub const DEFAULT_DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError>;
}

/// Asks the server which STARTUP options it supports.
/// Also used as a cheap keepalive probe.
#[derive(Debug, Clone, Copy)]
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}

/// Finalises connection negotiation. Must be the first request on a
/// connection other than OPTIONS.
#[derive(Debug, Clone, Default)]
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

impl Startup<'static> {
    /// Parses a STARTUP body. Servers and test doubles use this.
    pub fn deserialize(
        buf: &mut &[u8],
    ) -> Result<Self, super::frame_errors::LowLevelDeserializationError> {
        let options = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { options })
    }
}
