//! CQL responses sent by the server.
//!
//! The transport interprets only the bodies it needs for connection setup
//! and keepalive. RESULT and EVENT bodies are handed on untouched.

use std::collections::HashMap;
use std::fmt::Display;

use bytes::Bytes;

use super::frame_errors::CqlResponseParseError;
use super::types;
use super::TryFromPrimitiveError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Error(Error),
    Ready,
    Authenticate { authenticator_name: String },
    Supported(Supported),
    /// Raw RESULT body, decoded by the statement layer.
    Result(Bytes),
    /// Raw EVENT body, decoded by the event consumer.
    Event(Bytes),
    AuthChallenge(Option<Bytes>),
    AuthSuccess(Option<Bytes>),
}

impl Response {
    pub fn deserialize(opcode: ResponseOpcode, body: Bytes) -> Result<Response, CqlResponseParseError> {
        let buf = &mut &*body;
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => Response::Authenticate {
                authenticator_name: types::read_string(buf)
                    .map_err(CqlResponseParseError::CqlAuthenticateParseError)?
                    .to_owned(),
            },
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(body.clone()),
            ResponseOpcode::Event => Response::Event(body.clone()),
            ResponseOpcode::AuthChallenge | ResponseOpcode::AuthSuccess => {
                let token = types::read_bytes_opt(buf)
                    .map_err(|error| CqlResponseParseError::AuthBody { opcode, error })?
                    .map(Bytes::copy_from_slice);
                if opcode == ResponseOpcode::AuthChallenge {
                    Response::AuthChallenge(token)
                } else {
                    Response::AuthSuccess(token)
                }
            }
        };
        Ok(response)
    }

    pub fn opcode(&self) -> ResponseOpcode {
        match self {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Authenticate { .. } => ResponseOpcode::Authenticate,
            Response::Supported(_) => ResponseOpcode::Supported,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Event(_) => ResponseOpcode::Event,
            Response::AuthChallenge(_) => ResponseOpcode::AuthChallenge,
            Response::AuthSuccess(_) => ResponseOpcode::AuthSuccess,
        }
    }
}

/// An ERROR response. The code is kept numeric: mapping it to retry
/// decisions belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: i32,
    pub reason: String,
}

impl Error {
    /// Server-side code for a protocol violation by the client.
    pub const PROTOCOL_ERROR: i32 = 0x000A;

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let code = types::read_int(buf).map_err(CqlResponseParseError::CqlErrorParseError)?;
        let reason = types::read_string(buf)
            .map_err(CqlResponseParseError::CqlErrorParseError)?
            .to_owned();
        Ok(Error { code, reason })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Database returned an error (code {:#06x}): {}", self.code, self.reason)
    }
}

impl std::error::Error for Error {}

/// The server's answer to OPTIONS.
#[derive(Debug, Clone, Default)]
pub struct Supported {
    /// Option names mapped to their supported values.
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let options = types::read_string_multimap(buf)
            .map_err(CqlResponseParseError::CqlSupportedParseError)?;
        Ok(Supported { options })
    }
}
