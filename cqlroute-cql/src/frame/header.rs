//! The fixed-size header that precedes every frame.
//!
//! Protocol versions 1 and 2 use an 8-byte header with a one-byte, signed
//! stream id. From version 3 on the header is 9 bytes long and the stream id
//! is a big-endian `i16`.

use std::fmt::Display;

use bytes::BufMut;

use super::frame_errors::{FrameHeaderEncodeError, FrameHeaderParseError};
use super::TryFromPrimitiveError;

/// Largest body the protocol allows in a single frame (256 MiB).
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

const RESPONSE_DIRECTION_BIT: u8 = 0x80;

/// A native protocol version supported by the codec.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[non_exhaustive]
pub enum ProtocolVersion {
    V1 = 0x01,
    V2 = 0x02,
    V3 = 0x03,
    #[default]
    V4 = 0x04,
}

impl ProtocolVersion {
    /// Number of bytes in a frame header of this version.
    #[inline]
    pub const fn header_len(self) -> usize {
        if self.has_wide_stream_ids() {
            9
        } else {
            8
        }
    }

    /// Whether stream ids are encoded on two bytes.
    #[inline]
    pub const fn has_wide_stream_ids(self) -> bool {
        self as u8 >= ProtocolVersion::V3 as u8
    }

    /// The largest stream id a client may assign.
    #[inline]
    pub const fn max_stream_id(self) -> i16 {
        if self.has_wide_stream_ids() {
            i16::MAX
        } else {
            i8::MAX as i16
        }
    }

    /// How many non-negative stream ids are available on one connection.
    #[inline]
    pub const fn stream_id_count(self) -> usize {
        self.max_stream_id() as usize + 1
    }

    fn check_stream(self, stream: i16) -> Result<(), FrameHeaderEncodeError> {
        if !self.has_wide_stream_ids() && i8::try_from(stream).is_err() {
            return Err(FrameHeaderEncodeError::StreamIdOutOfRange {
                stream,
                version: self,
            });
        }
        Ok(())
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::V1),
            0x02 => Ok(Self::V2),
            0x03 => Ok(Self::V3),
            0x04 => Ok(Self::V4),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: value,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", *self as u8)
    }
}

/// Whether a frame travels from the client or from the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameDirection {
    Request,
    Response,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub direction: FrameDirection,
    pub flags: u8,
    pub stream: i16,
    pub opcode: u8,
    /// Number of body bytes that follow the header on the wire.
    pub length: usize,
}

impl FrameHeader {
    /// Size of this header once encoded.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.version.header_len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), FrameHeaderEncodeError> {
        self.version.check_stream(self.stream)?;
        if self.length > MAX_FRAME_LENGTH {
            return Err(FrameHeaderEncodeError::BodyTooLarge {
                length: self.length,
                max: MAX_FRAME_LENGTH,
            });
        }

        let direction_bit = match self.direction {
            FrameDirection::Request => 0,
            FrameDirection::Response => RESPONSE_DIRECTION_BIT,
        };
        buf.put_u8(self.version as u8 | direction_bit);
        buf.put_u8(self.flags);
        if self.version.has_wide_stream_ids() {
            buf.put_i16(self.stream);
        } else {
            // Range was checked above.
            buf.put_i8(self.stream as i8);
        }
        buf.put_u8(self.opcode);
        // MAX_FRAME_LENGTH fits in an i32.
        buf.put_i32(self.length as i32);
        Ok(())
    }

    /// Decodes a header from the front of `buf`, advancing it past the header.
    ///
    /// Fails with `HeaderTooShort` if `buf` does not hold the whole header yet;
    /// use [`header_len_for_version_byte`] to find out how many bytes are needed.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, FrameHeaderParseError> {
        let first = *buf.first().ok_or(FrameHeaderParseError::HeaderTooShort {
            expected: 1,
            received: 0,
        })?;
        let header_len = header_len_for_version_byte(first)?;
        if buf.len() < header_len {
            return Err(FrameHeaderParseError::HeaderTooShort {
                expected: header_len,
                received: buf.len(),
            });
        }
        let (raw, rest) = buf.split_at(header_len);
        *buf = rest;

        let version = version_from_byte(raw[0])?;
        let direction = if raw[0] & RESPONSE_DIRECTION_BIT != 0 {
            FrameDirection::Response
        } else {
            FrameDirection::Request
        };
        let flags = raw[1];
        let (stream, rest) = if version.has_wide_stream_ids() {
            (i16::from_be_bytes([raw[2], raw[3]]), &raw[4..])
        } else {
            ((raw[2] as i8).into(), &raw[3..])
        };
        let opcode = rest[0];
        let length = i32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
        if length < 0 {
            return Err(FrameHeaderParseError::NegativeBodyLength(length));
        }
        let length = length as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(FrameHeaderParseError::FrameTooLarge {
                length,
                max: MAX_FRAME_LENGTH,
            });
        }

        Ok(Self {
            version,
            direction,
            flags,
            stream,
            opcode,
            length,
        })
    }
}

fn version_from_byte(byte: u8) -> Result<ProtocolVersion, FrameHeaderParseError> {
    let raw = byte & !RESPONSE_DIRECTION_BIT;
    ProtocolVersion::try_from(raw).map_err(|_| FrameHeaderParseError::VersionNotSupported(raw))
}

/// Given the first byte of a frame, returns the length of its header.
pub fn header_len_for_version_byte(byte: u8) -> Result<usize, FrameHeaderParseError> {
    version_from_byte(byte).map(ProtocolVersion::header_len)
}
