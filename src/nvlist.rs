//! Packed property-list codec.
//!
//! Labels carry their configuration as a packed name/value list: a four
//! byte header selecting encoding and byte order, then an XDR stream of
//! `(name, type, value)` pairs terminated by eight zero bytes. Nested
//! lists inherit the outer encoding and are framed by their own
//! version/flags words and terminator.
//!
//! Only the XDR encoding is supported, and the value set covers what
//! pool labels actually use. The decoder has to survive arbitrary bytes:
//! torn and half-written labels are routinely handed to it, so every
//! length and count is validated against the remaining input before it
//! is trusted.

use thiserror::Error;

const ENCODING_XDR: u8 = 1;
const ENDIAN_BIG: u8 = 0;
const ENDIAN_LITTLE: u8 = 1;

/// List flag: names are unique within the list.
const NV_UNIQUE_NAME: u32 = 0x1;

// Wire ids for the supported pair types.
const TYPE_BOOLEAN: u32 = 1;
const TYPE_UINT64: u32 = 8;
const TYPE_STRING: u32 = 9;
const TYPE_UINT64_ARRAY: u32 = 16;
const TYPE_NVLIST: u32 = 19;
const TYPE_NVLIST_ARRAY: u32 = 20;

/// A single typed value in a property list.
#[derive(Debug, Clone, PartialEq)]
pub enum NvValue {
    /// Presence flag without a payload.
    Flag,
    Uint64(u64),
    Str(String),
    Uint64Array(Vec<u64>),
    List(NvList),
    ListArray(Vec<NvList>),
}

/// An ordered map of named typed values with unique names.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NvList {
    pairs: Vec<(String, NvValue)>,
}

impl NvList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NvValue)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Insert `value` under `name`, replacing any existing pair in place.
    pub fn set(&mut self, name: impl Into<String>, value: NvValue) {
        let name = name.into();
        match self.pairs.iter_mut().find(|(n, _)| *n == name) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((name, value)),
        }
    }

    pub fn add_flag(&mut self, name: impl Into<String>) {
        self.set(name, NvValue::Flag);
    }

    pub fn add_uint64(&mut self, name: impl Into<String>, value: u64) {
        self.set(name, NvValue::Uint64(value));
    }

    pub fn add_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set(name, NvValue::Str(value.into()));
    }

    pub fn add_uint64_array(&mut self, name: impl Into<String>, value: Vec<u64>) {
        self.set(name, NvValue::Uint64Array(value));
    }

    pub fn add_list(&mut self, name: impl Into<String>, value: NvList) {
        self.set(name, NvValue::List(value));
    }

    pub fn add_list_array(&mut self, name: impl Into<String>, value: Vec<NvList>) {
        self.set(name, NvValue::ListArray(value));
    }

    pub fn remove(&mut self, name: &str) -> Option<NvValue> {
        let idx = self.pairs.iter().position(|(n, _)| n == name)?;
        Some(self.pairs.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn uint64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            NvValue::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            NvValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn uint64_array(&self, name: &str) -> Option<&[u64]> {
        match self.get(name)? {
            NvValue::Uint64Array(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> Option<&NvList> {
        match self.get(name)? {
            NvValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn list_mut(&mut self, name: &str) -> Option<&mut NvList> {
        match self.pairs.iter_mut().find(|(n, _)| n == name)?.1 {
            NvValue::List(ref mut v) => Some(v),
            _ => None,
        }
    }

    pub fn list_array(&self, name: &str) -> Option<&[NvList]> {
        match self.get(name)? {
            NvValue::ListArray(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn list_array_mut(&mut self, name: &str) -> Option<&mut Vec<NvList>> {
        match self.pairs.iter_mut().find(|(n, _)| n == name)?.1 {
            NvValue::ListArray(ref mut v) => Some(v),
            _ => None,
        }
    }

    /// Encode the list with the four byte packing header.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = vec![ENCODING_XDR, ENDIAN_LITTLE, 0, 0];
        self.encode_body(&mut out);
        out
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_u32(out, 0); // list version
        put_u32(out, NV_UNIQUE_NAME);
        for (name, value) in &self.pairs {
            encode_pair(name, value, out);
        }
        put_u32(out, 0);
        put_u32(out, 0);
    }

    /// Decode a packed list. `bytes` may be longer than the encoded list;
    /// trailing bytes are ignored, which is exactly the situation when
    /// decoding the fixed-size label subregion.
    pub fn unpack(bytes: &[u8]) -> Result<NvList, NvDecodeError> {
        if bytes.len() < 4 {
            return Err(NvDecodeError::Truncated { offset: 0 });
        }
        let encoding = bytes[0];
        if encoding != ENCODING_XDR {
            return Err(NvDecodeError::UnsupportedEncoding { encoding });
        }
        let endian = bytes[1];
        if endian != ENDIAN_BIG && endian != ENDIAN_LITTLE {
            return Err(NvDecodeError::UnknownEndian { endian });
        }
        let mut cursor = Cursor {
            data: bytes,
            offset: 4,
        };
        decode_body(&mut cursor)
    }
}

fn encode_pair(name: &str, value: &NvValue, out: &mut Vec<u8>) {
    let start = out.len();
    // Encoded and decoded sizes are backpatched once the value is known.
    put_u32(out, 0);
    put_u32(out, 0);
    put_string(out, name);
    let (data_type, count) = match value {
        NvValue::Flag => (TYPE_BOOLEAN, 0),
        NvValue::Uint64(_) => (TYPE_UINT64, 1),
        NvValue::Str(_) => (TYPE_STRING, 1),
        NvValue::Uint64Array(v) => (TYPE_UINT64_ARRAY, v.len()),
        NvValue::List(_) => (TYPE_NVLIST, 1),
        NvValue::ListArray(v) => (TYPE_NVLIST_ARRAY, v.len()),
    };
    put_u32(out, data_type);
    put_u32(out, count as u32);
    match value {
        NvValue::Flag => {}
        NvValue::Uint64(v) => put_u64(out, *v),
        NvValue::Str(s) => put_string(out, s),
        NvValue::Uint64Array(vs) => {
            for v in vs {
                put_u64(out, *v);
            }
        }
        NvValue::List(list) => list.encode_body(out),
        NvValue::ListArray(lists) => {
            for list in lists {
                list.encode_body(out);
            }
        }
    }
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
    out[start + 4..start + 8].copy_from_slice(&size.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
    let pad = (4 - value.len() % 4) % 4;
    out.extend_from_slice(&[0u8; 3][..pad]);
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], NvDecodeError> {
        if len > self.remaining() {
            return Err(NvDecodeError::Truncated {
                offset: self.offset,
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn get_u32(&mut self) -> Result<u32, NvDecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn get_u64(&mut self) -> Result<u64, NvDecodeError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn get_string(&mut self) -> Result<String, NvDecodeError> {
        let offset = self.offset;
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        let value = std::str::from_utf8(bytes)
            .map_err(|_| NvDecodeError::InvalidString { offset })?
            .to_string();
        let pad = (4 - len % 4) % 4;
        self.take(pad)?;
        Ok(value)
    }
}

fn decode_body(cursor: &mut Cursor<'_>) -> Result<NvList, NvDecodeError> {
    let version = cursor.get_u32()?;
    if version != 0 {
        return Err(NvDecodeError::UnknownVersion { version });
    }
    let flags = cursor.get_u32()?;
    if flags & !0x3 != 0 {
        return Err(NvDecodeError::UnknownFlags { flags });
    }
    let mut list = NvList::new();
    loop {
        let pair_start = cursor.offset;
        let encoded_size = cursor.get_u32()? as usize;
        let decoded_size = cursor.get_u32()? as usize;
        if encoded_size == 0 && decoded_size == 0 {
            break;
        }
        // The declared pair size must fit the input and at least cover
        // the two size words already consumed.
        if encoded_size < 8 || encoded_size > cursor.data.len() - pair_start {
            return Err(NvDecodeError::InvalidEncodedSize {
                offset: pair_start,
                encoded_size,
            });
        }
        let name = cursor.get_string()?;
        let data_type = cursor.get_u32()?;
        let count = cursor.get_u32()? as usize;
        let value = decode_value(cursor, data_type, count)?;
        if cursor.offset > pair_start + encoded_size {
            return Err(NvDecodeError::InvalidEncodedSize {
                offset: pair_start,
                encoded_size,
            });
        }
        cursor.offset = pair_start + encoded_size;
        list.set(name, value);
    }
    Ok(list)
}

fn decode_value(
    cursor: &mut Cursor<'_>,
    data_type: u32,
    count: usize,
) -> Result<NvValue, NvDecodeError> {
    match data_type {
        TYPE_BOOLEAN => match count {
            0 => Ok(NvValue::Flag),
            _ => Err(NvDecodeError::InvalidCount { data_type, count }),
        },
        TYPE_UINT64 => match count {
            1 => Ok(NvValue::Uint64(cursor.get_u64()?)),
            _ => Err(NvDecodeError::InvalidCount { data_type, count }),
        },
        TYPE_STRING => match count {
            1 => Ok(NvValue::Str(cursor.get_string()?)),
            _ => Err(NvDecodeError::InvalidCount { data_type, count }),
        },
        TYPE_UINT64_ARRAY => {
            if count > cursor.remaining() / 8 {
                return Err(NvDecodeError::InvalidCount { data_type, count });
            }
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(cursor.get_u64()?);
            }
            Ok(NvValue::Uint64Array(values))
        }
        TYPE_NVLIST => match count {
            1 => Ok(NvValue::List(decode_body(cursor)?)),
            _ => Err(NvDecodeError::InvalidCount { data_type, count }),
        },
        TYPE_NVLIST_ARRAY => {
            // Each element is at least version + flags + terminator.
            if count > cursor.remaining() / 16 {
                return Err(NvDecodeError::InvalidCount { data_type, count });
            }
            let mut lists = Vec::with_capacity(count);
            for _ in 0..count {
                lists.push(decode_body(cursor)?);
            }
            Ok(NvValue::ListArray(lists))
        }
        _ => Err(NvDecodeError::UnsupportedType { data_type }),
    }
}

#[derive(Debug, Error)]
pub enum NvDecodeError {
    #[error("input truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("unsupported encoding {encoding}")]
    UnsupportedEncoding { encoding: u8 },
    #[error("unknown endian marker {endian}")]
    UnknownEndian { endian: u8 },
    #[error("unknown list version {version}")]
    UnknownVersion { version: u32 },
    #[error("unknown list flags {flags:#x}")]
    UnknownFlags { flags: u32 },
    #[error("unsupported pair type {data_type}")]
    UnsupportedType { data_type: u32 },
    #[error("invalid count {count} for pair type {data_type}")]
    InvalidCount { data_type: u32, count: usize },
    #[error("invalid encoded size {encoded_size} at offset {offset}")]
    InvalidEncodedSize { offset: usize, encoded_size: usize },
    #[error("invalid string at offset {offset}")]
    InvalidString { offset: usize },
}
