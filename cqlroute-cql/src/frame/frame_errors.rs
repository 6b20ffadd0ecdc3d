//! Errors raised while encoding and decoding frames and their primitives.

use std::num::TryFromIntError;
use std::str::Utf8Error;
use std::sync::Arc;

use thiserror::Error;

use super::header::ProtocolVersion;
use super::response::ResponseOpcode;
use super::TryFromPrimitiveError;

/// A low-level failure while decoding one of the protocol primitives
/// (`int`, `string`, `bytes`, `inet`, ...).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error that occurred while decoding a frame header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    #[error("Received frame header of unsupported protocol version {0}")]
    VersionNotSupported(u8),
    #[error("Frame header too short: expected {expected} bytes, received {received}")]
    HeaderTooShort { expected: usize, received: usize },
    #[error("Frame declares a negative body length: {0}")]
    NegativeBodyLength(i32),
    #[error("Frame body of {length} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },
}

/// An error that occurred while encoding a frame header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameHeaderEncodeError {
    #[error("Stream id {stream} is out of range for protocol {version}")]
    StreamIdOutOfRange {
        stream: i16,
        version: ProtocolVersion,
    },
    #[error("Frame body of {length} bytes exceeds the maximum of {max} bytes")]
    BodyTooLarge { length: usize, max: usize },
}

/// A fatal error produced while turning received bytes into frames.
///
/// After returning one of these the assembler refuses further input:
/// the byte stream can no longer be trusted to be aligned on frame boundaries.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error(transparent)]
    HeaderParse(#[from] FrameHeaderParseError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Frame decompression failed: {0}")]
    FrameDecompression(String),
    #[error("Decompressed body has {actual} bytes, but {expected} were declared")]
    DecompressedLengthMismatch { expected: usize, actual: usize },
    #[error("Frame assembler was previously fed a corrupted stream")]
    AssemblerPoisoned,
    #[error("Connection was closed before the frame was complete: {received} of {expected} bytes read")]
    ConnectionClosed { expected: usize, received: usize },
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error that occurred while parsing the optional extensions
/// (tracing id, warnings, custom payload) that precede a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameBodyExtensionsParseError {
    #[error("Malformed tracing id: {0}")]
    TraceIdParse(LowLevelDeserializationError),
    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),
    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),
}

/// An error that occurred while serializing a request frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("Request body field does not fit its length prefix: {0}")]
    FieldTooLong(#[from] TryFromIntError),
    #[error("Frame compression failed: {0}")]
    Compression(String),
    #[error(transparent)]
    HeaderEncode(#[from] FrameHeaderEncodeError),
}

/// An error that occurred while parsing a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Unrecognized response opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize {opcode:?} response: {error}")]
    AuthBody {
        opcode: ResponseOpcode,
        error: LowLevelDeserializationError,
    },
}
