pub mod assembler;
pub mod frame_errors;
pub mod header;
pub mod request;
pub mod response;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use frame_errors::{
    CqlRequestSerializationError, FrameBodyExtensionsParseError, FrameError,
    FrameHeaderEncodeError,
};
use header::{FrameDirection, FrameHeader, ProtocolVersion, MAX_FRAME_LENGTH};
use thiserror::Error;
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use request::{RequestOpcode, SerializableRequest};

/// Frame header flags.
pub mod flag {
    /// The frame body is compressed with the negotiated algorithm.
    pub const COMPRESSION: u8 = 0x01;
    /// Request: tracing asked for. Response: body starts with a tracing id.
    pub const TRACING: u8 = 0x02;
    /// The body starts with a custom payload `[bytes map]`.
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    /// The response body starts with a `[string list]` of warnings.
    pub const WARNING: u8 = 0x08;
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name of the algorithm in the STARTUP and SUPPORTED messages.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown compression algorithm: {0}")]
pub struct UnknownCompressionError(String);

impl FromStr for Compression {
    type Err = UnknownCompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lz4" => Ok(Compression::Lz4),
            "snappy" => Ok(Compression::Snappy),
            other => Err(UnknownCompressionError(other.to_owned())),
        }
    }
}

/// A request frame with its header already laid out.
///
/// The stream id is left blank until the connection assigns one
/// with [`SerializedRequest::set_stream`].
pub struct SerializedRequest {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let mut body = Vec::new();
        req.serialize(&mut body)?;
        Self::from_body(R::OPCODE, &body, version, compression, tracing)
    }

    /// Builds a frame around a body serialized elsewhere,
    /// e.g. by a statement layer that owns QUERY or EXECUTE encoding.
    pub fn from_body(
        opcode: RequestOpcode,
        body: &[u8],
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let header_len = version.header_len();
        let mut flags = 0;
        let mut data = vec![0; header_len];

        if let Some(compression) = compression {
            flags |= flag::COMPRESSION;
            compress_append(body, compression, &mut data)?;
        } else {
            data.extend_from_slice(body);
        }

        if tracing {
            flags |= flag::TRACING;
        }

        let header = FrameHeader {
            version,
            direction: FrameDirection::Request,
            flags,
            stream: 0,
            opcode: opcode as u8,
            length: data.len() - header_len,
        };
        header.encode(&mut &mut data[..header_len])?;

        Ok(Self { version, data })
    }

    /// Writes `stream` into the header. Fails if the id does not fit
    /// the stream id width of the frame's protocol version.
    pub fn set_stream(&mut self, stream: i16) -> Result<(), FrameHeaderEncodeError> {
        if self.version.has_wide_stream_ids() {
            self.data[2..4].copy_from_slice(&stream.to_be_bytes());
        } else {
            let narrow =
                i8::try_from(stream).map_err(|_| FrameHeaderEncodeError::StreamIdOutOfRange {
                    stream,
                    version: self.version,
                })?;
            self.data[2] = narrow as u8;
        }
        Ok(())
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// A response body with its leading extensions split off.
#[derive(Debug, Clone, Default)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

/// Strips the extensions announced by `flags` from the front of an
/// already decompressed response body.
pub fn parse_response_body_extensions(
    flags: u8,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    let trace_id = if flags & flag::TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & flag::WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & flag::CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)
            .map_err(FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    if uncomp_body.len() > MAX_FRAME_LENGTH {
        return Err(FrameHeaderEncodeError::BodyTooLarge {
            length: uncomp_body.len(),
            max: MAX_FRAME_LENGTH,
        }
        .into());
    }
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|err| CqlRequestSerializationError::Compression(err.to_string()))?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

/// Decompresses a whole frame body.
///
/// Both formats announce the uncompressed size up front; a result of a
/// different size means the stream is corrupted.
pub fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    let (expected, uncomp_body) = match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression(
                    "lz4 body shorter than its length prefix".to_owned(),
                ));
            }
            let uncomp_len = comp_body.get_u32() as usize;
            if uncomp_len > MAX_FRAME_LENGTH {
                return Err(FrameError::FrameDecompression(format!(
                    "declared uncompressed length {uncomp_len} exceeds the frame limit"
                )));
            }
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|err| FrameError::FrameDecompression(err.to_string()))?;
            (uncomp_len, uncomp_body)
        }
        Compression::Snappy => {
            let uncomp_len = snap::raw::decompress_len(comp_body)
                .map_err(|err| FrameError::FrameDecompression(err.to_string()))?;
            let uncomp_body = snap::raw::Decoder::new()
                .decompress_vec(comp_body)
                .map_err(|err| FrameError::FrameDecompression(err.to_string()))?;
            (uncomp_len, uncomp_body)
        }
    };
    if uncomp_body.len() != expected {
        return Err(FrameError::DecompressedLengthMismatch {
            expected,
            actual: uncomp_body.len(),
        });
    }
    Ok(uncomp_body)
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

impl<T: Copy + std::fmt::Debug> TryFromPrimitiveError<T> {
    pub fn primitive(&self) -> T {
        self.primitive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::Options;
    use assert_matches::assert_matches;

    #[test]
    fn test_lz4_compress() {
        let mut out = Vec::from(&b"Hello"[..]);
        let uncomp_body = b", World!";
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        compress_append(uncomp_body, Compression::Lz4, &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn decompress_inverts_compress() {
        let uncomp_body = "Hello, World!".repeat(100);
        for compression in [Compression::Lz4, Compression::Snappy] {
            let mut comp_body = Vec::new();
            compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
            assert!(comp_body.len() < uncomp_body.len());
            let result = decompress(&comp_body[..], compression).unwrap();
            assert_eq!(uncomp_body.as_bytes(), result);
        }
    }

    #[test]
    fn lz4_declared_length_must_match() {
        let mut comp_body = Vec::new();
        compress_append(b"0123456789", Compression::Lz4, &mut comp_body).unwrap();
        // Claim one byte more than the block really holds.
        comp_body[..4].copy_from_slice(&11u32.to_be_bytes());
        assert!(decompress(&comp_body, Compression::Lz4).is_err());

        assert_matches!(
            decompress(&[0, 0], Compression::Lz4),
            Err(FrameError::FrameDecompression(_))
        );
    }

    #[test]
    fn serialized_request_header_width() {
        let mut v2 =
            SerializedRequest::make(&Options, ProtocolVersion::V2, None, false).unwrap();
        assert_eq!(v2.get_data(), &[0x02, 0, 0, RequestOpcode::Options as u8, 0, 0, 0, 0]);
        v2.set_stream(127).unwrap();
        assert_eq!(v2.get_data()[2], 127);
        assert_matches!(
            v2.set_stream(200),
            Err(FrameHeaderEncodeError::StreamIdOutOfRange { stream: 200, .. })
        );

        let mut v4 =
            SerializedRequest::make(&Options, ProtocolVersion::V4, None, true).unwrap();
        v4.set_stream(200).unwrap();
        let header = FrameHeader::decode(&mut v4.get_data()).unwrap();
        assert_eq!(header.stream, 200);
        assert_eq!(header.flags, flag::TRACING);
        assert_eq!(header.length, 0);
    }

    #[test]
    fn body_extensions_are_stripped_in_order() {
        let trace_id = Uuid::from_u128(0x1234);
        let mut raw = Vec::new();
        types::write_uuid(&trace_id, &mut raw);
        types::write_string_list(&["slow query"], &mut raw).unwrap();
        let mut payload = HashMap::new();
        payload.insert("k".to_owned(), Bytes::from_static(b"v"));
        types::write_bytes_map(&payload, &mut raw).unwrap();
        raw.extend_from_slice(b"rest");

        let flags = flag::TRACING | flag::WARNING | flag::CUSTOM_PAYLOAD;
        let parsed = parse_response_body_extensions(flags, raw.into()).unwrap();
        assert_eq!(parsed.trace_id, Some(trace_id));
        assert_eq!(parsed.warnings, vec!["slow query".to_owned()]);
        assert_eq!(parsed.custom_payload, Some(payload));
        assert_eq!(&parsed.body[..], b"rest");

        assert_matches!(
            parse_response_body_extensions(flag::TRACING, Bytes::from_static(&[1, 2])),
            Err(FrameBodyExtensionsParseError::TraceIdParse(_))
        );
    }
}
