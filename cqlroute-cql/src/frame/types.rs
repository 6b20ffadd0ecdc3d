//! CQL binary protocol in-wire types.
//!
//! Every reader takes `&mut &[u8]` and advances the slice past what it consumed.
//! A declared length that runs past the end of the buffer is always an error,
//! the value is never silently truncated.

use super::frame_errors::LowLevelDeserializationError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Bytes, BufMut};
use std::collections::HashMap;
use std::convert::TryInto;
use std::net::{IpAddr, SocketAddr};
use std::num::TryFromIntError;
use std::str;
use uuid::Uuid;

/// A `[bytes]` value as it appears in a request: the protocol
/// distinguishes an absent value (`null`, length -1) from a value
/// the client asks the server to leave untouched (`unset`, length -2).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    #[inline]
    pub fn as_value(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            RawValue::Null | RawValue::Unset => None,
        }
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

// Fixed-width integers

pub fn read_int(buf: &mut &[u8]) -> Result<i32, LowLevelDeserializationError> {
    Ok(buf.read_i32::<BigEndian>()?)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, LowLevelDeserializationError> {
    Ok(buf.read_i64::<BigEndian>()?)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

/// Reads the protocol's `[short]`, an unsigned 16-bit integer.
pub fn read_short(buf: &mut &[u8]) -> Result<u16, LowLevelDeserializationError> {
    Ok(buf.read_u16::<BigEndian>()?)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub fn read_signed_short(buf: &mut &[u8]) -> Result<i16, LowLevelDeserializationError> {
    Ok(buf.read_i16::<BigEndian>()?)
}

pub fn write_signed_short(v: i16, buf: &mut impl BufMut) {
    buf.put_i16(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let v = read_int(buf)?;
    Ok(v.try_into()?)
}

pub(crate) fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int(v.try_into()?, buf);
    Ok(())
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(read_short(buf)?.into())
}

pub(crate) fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short(v.try_into()?, buf);
    Ok(())
}

// Byte sequences

/// Reads `[bytes]` where -1 encodes `null`.
///
/// Any other negative length is rejected; `unset` only travels
/// from client to server and never appears in a response.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    match read_int(buf)? {
        -1 => Ok(None),
        len if len >= 0 => Ok(Some(read_raw_bytes(len as usize, buf)?)),
        len => Err(LowLevelDeserializationError::InvalidValueLength(len)),
    }
}

/// Reads `[bytes]` that is not allowed to be `null`.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

/// Reads `[value]`, accepting both the `null` and `unset` sentinels.
pub fn read_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, LowLevelDeserializationError> {
    match read_int(buf)? {
        -2 => Ok(RawValue::Unset),
        -1 => Ok(RawValue::Null),
        len if len >= 0 => Ok(RawValue::Value(read_raw_bytes(len as usize, buf)?)),
        len => Err(LowLevelDeserializationError::InvalidValueLength(len)),
    }
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn write_value(v: RawValue<'_>, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    match v {
        RawValue::Null => write_int(-1, buf),
        RawValue::Unset => write_int(-2, buf),
        RawValue::Value(bytes) => write_bytes(bytes, buf)?,
    }
    Ok(())
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

// Strings

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let raw = read_short_bytes(buf)?;
    Ok(str::from_utf8(raw)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_bytes(v.as_bytes(), buf)
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let raw = read_bytes(buf)?;
    Ok(str::from_utf8(raw)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_bytes(v.as_bytes(), buf)
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    (0..len)
        .map(|_| read_string(buf).map(str::to_owned))
        .collect()
}

pub fn write_string_list(
    v: &[impl AsRef<str>],
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for s in v {
        write_string(s.as_ref(), buf)?;
    }
    Ok(())
}

// Maps

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

/// Reads `[bytes map]`. Values are copied out, so the map outlives the frame.
pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = Bytes::copy_from_slice(read_bytes(buf)?);
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_bytes_map<B>(v: &HashMap<String, B>, buf: &mut impl BufMut) -> Result<(), TryFromIntError>
where
    B: AsRef<[u8]>,
{
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key, buf)?;
        write_bytes(val.as_ref(), buf)?;
    }
    Ok(())
}

// Uuid and inet

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;
    let mut arr = [0u8; 16];
    arr.copy_from_slice(raw);
    Ok(Uuid::from_bytes(arr))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(uuid.as_bytes());
}

pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let len = buf.read_u8()?;
    let ip_addr = match len {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(read_raw_bytes(4, buf)?);
            IpAddr::from(octets)
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(read_raw_bytes(16, buf)?);
            IpAddr::from(octets)
        }
        v => return Err(LowLevelDeserializationError::InvalidInetLength(v)),
    };
    let port: u16 = read_int(buf)?.try_into()?;

    Ok(SocketAddr::new(ip_addr, port))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
    write_int(addr.port().into(), buf)
}
