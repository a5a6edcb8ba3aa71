//! Key codecs.
//!
//! A [`KeyCodec`] turns typed keys into the byte strings stored in index
//! slots and orders those byte strings. The page algorithm only ever sees
//! encoded keys and the codec's comparator, so bitmask, integer, string and
//! compound indexes all share one B-tree implementation.

use bytes::Bytes;
use kestrel_common::{KestrelError, Result};
use std::cmp::Ordering;
use std::fmt::Debug;

/// Encodes, decodes and orders index keys.
pub trait KeyCodec: Send + Sync {
    /// The typed key.
    type Key: Clone + Debug + Send + Sync;

    /// Upper bound on the length of an encoded key. Fixes the slot width.
    fn max_encoded_len(&self) -> usize;

    /// Appends the encoding of `key` to `out`.
    fn encode(&self, key: &Self::Key, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes a key previously produced by [`encode`](Self::encode).
    fn decode(&self, bytes: &[u8]) -> Result<Self::Key>;

    /// Orders two encoded keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Encodes `key` into a new buffer, enforcing the maximum length.
    fn encode_to_vec(&self, key: &Self::Key) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.max_encoded_len());
        self.encode(key, &mut out)?;
        if out.len() > self.max_encoded_len() {
            return Err(KestrelError::KeyTooLarge {
                size: out.len(),
                max: self.max_encoded_len(),
            });
        }
        Ok(out)
    }
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        KestrelError::KeyEncoding(format!(
            "{} key must be {} bytes, got {}",
            what,
            N,
            bytes.len()
        ))
    })
}

// =============================================================================
// Scalar codecs
// =============================================================================

/// Unsigned 64-bit keys, big-endian so byte order matches numeric order.
///
/// Backs bitmask indexes.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl KeyCodec for U64Codec {
    type Key = u64;

    fn max_encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, key: &u64, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&key.to_be_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<u64> {
        Ok(u64::from_be_bytes(fixed(bytes, "u64")?))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Signed 64-bit keys. The sign bit is flipped so negative values sort first.
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl KeyCodec for I64Codec {
    type Key = i64;

    fn max_encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, key: &i64, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&((*key as u64) ^ (1 << 63)).to_be_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<i64> {
        Ok((u64::from_be_bytes(fixed(bytes, "i64")?) ^ (1 << 63)) as i64)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Byte-string keys (strings, byte arrays) ordered bytewise.
#[derive(Debug, Clone, Copy)]
pub struct BytesCodec {
    max_len: usize,
}

impl BytesCodec {
    /// Creates a codec for keys of at most `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Returns the maximum key length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl KeyCodec for BytesCodec {
    type Key = Bytes;

    fn max_encoded_len(&self) -> usize {
        self.max_len
    }

    fn encode(&self, key: &Bytes, out: &mut Vec<u8>) -> Result<()> {
        if key.len() > self.max_len {
            return Err(KestrelError::KeyTooLarge {
                size: key.len(),
                max: self.max_len,
            });
        }
        out.extend_from_slice(key);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Returns the smallest byte string greater than every string starting with
/// `prefix`, or None if no such string exists (empty or all-0xFF prefix).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(last) = succ.pop() {
        if last != 0xFF {
            succ.push(last + 1);
            return Some(succ);
        }
    }
    None
}

// =============================================================================
// Compound codec
// =============================================================================

/// Type of one field of a compound key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Fixed-point decimal stored as a scaled i128.
    Decimal { scale: u8 },
    Guid,
    String { max_len: u16 },
    Bytes { max_len: u16 },
}

impl FieldType {
    /// Returns the encoded width of fixed-size fields.
    fn fixed_width(&self) -> Option<usize> {
        Some(match self {
            FieldType::Bool | FieldType::I8 | FieldType::U8 => 1,
            FieldType::I16 | FieldType::U16 => 2,
            FieldType::I32 | FieldType::U32 | FieldType::F32 => 4,
            FieldType::I64 | FieldType::U64 | FieldType::F64 => 8,
            FieldType::Decimal { .. } | FieldType::Guid => 16,
            FieldType::String { .. } | FieldType::Bytes { .. } => return None,
        })
    }

    fn max_width(&self) -> usize {
        match self {
            FieldType::String { max_len } | FieldType::Bytes { max_len } => 2 + *max_len as usize,
            other => other.fixed_width().unwrap_or(0),
        }
    }
}

/// Value of one field of a compound key.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(i128),
    Guid([u8; 16]),
    String(String),
    Bytes(Vec<u8>),
}

/// Multi-field keys compared field by field.
///
/// Numbers are stored big-endian with the sign bit flipped (floats use the
/// IEEE total-order transform), so each fixed-size field compares bytewise.
/// Strings and byte arrays carry a u16 length prefix. A key may hold fewer
/// fields than the codec declares; such a prefix sorts before every key that
/// extends it, which makes partial keys usable as lower bounds.
#[derive(Debug, Clone)]
pub struct CompoundCodec {
    fields: Vec<FieldType>,
}

impl CompoundCodec {
    /// Creates a codec for keys with the given field types.
    pub fn new(fields: Vec<FieldType>) -> Self {
        Self { fields }
    }

    /// Returns the field types.
    pub fn fields(&self) -> &[FieldType] {
        &self.fields
    }

    fn mismatch(i: usize, ty: &FieldType, value: &FieldValue) -> KestrelError {
        KestrelError::KeyEncoding(format!(
            "field {} expects {:?}, got {:?}",
            i, ty, value
        ))
    }

    fn encode_field(i: usize, ty: &FieldType, value: &FieldValue, out: &mut Vec<u8>) -> Result<()> {
        match (ty, value) {
            (FieldType::Bool, FieldValue::Bool(v)) => out.push(*v as u8),
            (FieldType::I8, FieldValue::I8(v)) => out.push((*v as u8) ^ 0x80),
            (FieldType::I16, FieldValue::I16(v)) => {
                out.extend_from_slice(&((*v as u16) ^ (1 << 15)).to_be_bytes())
            }
            (FieldType::I32, FieldValue::I32(v)) => {
                out.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes())
            }
            (FieldType::I64, FieldValue::I64(v)) => {
                out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes())
            }
            (FieldType::U8, FieldValue::U8(v)) => out.push(*v),
            (FieldType::U16, FieldValue::U16(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (FieldType::U32, FieldValue::U32(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (FieldType::U64, FieldValue::U64(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (FieldType::F32, FieldValue::F32(v)) => {
                let bits = v.to_bits();
                let ordered = if bits >> 31 == 1 { !bits } else { bits | (1 << 31) };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            (FieldType::F64, FieldValue::F64(v)) => {
                let bits = v.to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            (FieldType::Decimal { .. }, FieldValue::Decimal(v)) => {
                out.extend_from_slice(&((*v as u128) ^ (1 << 127)).to_be_bytes())
            }
            (FieldType::Guid, FieldValue::Guid(v)) => out.extend_from_slice(v),
            (FieldType::String { max_len }, FieldValue::String(s)) => {
                Self::encode_var(s.as_bytes(), *max_len, out)?
            }
            (FieldType::Bytes { max_len }, FieldValue::Bytes(b)) => {
                Self::encode_var(b, *max_len, out)?
            }
            _ => return Err(Self::mismatch(i, ty, value)),
        }
        Ok(())
    }

    fn encode_var(bytes: &[u8], max_len: u16, out: &mut Vec<u8>) -> Result<()> {
        if bytes.len() > max_len as usize {
            return Err(KestrelError::KeyTooLarge {
                size: bytes.len(),
                max: max_len as usize,
            });
        }
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
        Ok(())
    }

    /// Splits the next field off `bytes`, returning (content, rest).
    fn split_field<'b>(ty: &FieldType, bytes: &'b [u8]) -> Option<(&'b [u8], &'b [u8])> {
        match ty.fixed_width() {
            Some(w) if bytes.len() >= w => Some(bytes.split_at(w)),
            Some(_) => None,
            None => {
                if bytes.len() < 2 {
                    return None;
                }
                let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
                let rest = &bytes[2..];
                if rest.len() < len {
                    return None;
                }
                Some(rest.split_at(len))
            }
        }
    }

    fn decode_field(ty: &FieldType, c: &[u8]) -> Result<FieldValue> {
        Ok(match ty {
            FieldType::Bool => FieldValue::Bool(c[0] != 0),
            FieldType::I8 => FieldValue::I8((c[0] ^ 0x80) as i8),
            FieldType::I16 => FieldValue::I16((u16::from_be_bytes(fixed(c, "i16")?) ^ (1 << 15)) as i16),
            FieldType::I32 => FieldValue::I32((u32::from_be_bytes(fixed(c, "i32")?) ^ (1 << 31)) as i32),
            FieldType::I64 => FieldValue::I64((u64::from_be_bytes(fixed(c, "i64")?) ^ (1 << 63)) as i64),
            FieldType::U8 => FieldValue::U8(c[0]),
            FieldType::U16 => FieldValue::U16(u16::from_be_bytes(fixed(c, "u16")?)),
            FieldType::U32 => FieldValue::U32(u32::from_be_bytes(fixed(c, "u32")?)),
            FieldType::U64 => FieldValue::U64(u64::from_be_bytes(fixed(c, "u64")?)),
            FieldType::F32 => {
                let ordered = u32::from_be_bytes(fixed(c, "f32")?);
                let bits = if ordered >> 31 == 1 { ordered & !(1 << 31) } else { !ordered };
                FieldValue::F32(f32::from_bits(bits))
            }
            FieldType::F64 => {
                let ordered = u64::from_be_bytes(fixed(c, "f64")?);
                let bits = if ordered >> 63 == 1 { ordered & !(1 << 63) } else { !ordered };
                FieldValue::F64(f64::from_bits(bits))
            }
            FieldType::Decimal { .. } => {
                FieldValue::Decimal((u128::from_be_bytes(fixed(c, "decimal")?) ^ (1 << 127)) as i128)
            }
            FieldType::Guid => FieldValue::Guid(fixed(c, "guid")?),
            FieldType::String { .. } => FieldValue::String(
                String::from_utf8(c.to_vec())
                    .map_err(|e| KestrelError::KeyEncoding(format!("invalid utf-8: {}", e)))?,
            ),
            FieldType::Bytes { .. } => FieldValue::Bytes(c.to_vec()),
        })
    }
}

impl KeyCodec for CompoundCodec {
    type Key = Vec<FieldValue>;

    fn max_encoded_len(&self) -> usize {
        self.fields.iter().map(FieldType::max_width).sum()
    }

    fn encode(&self, key: &Vec<FieldValue>, out: &mut Vec<u8>) -> Result<()> {
        if key.len() > self.fields.len() {
            return Err(KestrelError::KeyEncoding(format!(
                "key has {} fields, index has {}",
                key.len(),
                self.fields.len()
            )));
        }
        for (i, (ty, value)) in self.fields.iter().zip(key).enumerate() {
            Self::encode_field(i, ty, value, out)?;
        }
        Ok(())
    }

    fn decode(&self, mut bytes: &[u8]) -> Result<Vec<FieldValue>> {
        let mut values = Vec::with_capacity(self.fields.len());
        for ty in &self.fields {
            if bytes.is_empty() {
                break;
            }
            let (content, rest) = Self::split_field(ty, bytes).ok_or_else(|| {
                KestrelError::KeyEncoding(format!("truncated {:?} field", ty))
            })?;
            values.push(Self::decode_field(ty, content)?);
            bytes = rest;
        }
        if !bytes.is_empty() {
            return Err(KestrelError::KeyEncoding(format!(
                "{} trailing bytes after the last field",
                bytes.len()
            )));
        }
        Ok(values)
    }

    fn compare(&self, mut a: &[u8], mut b: &[u8]) -> Ordering {
        for ty in &self.fields {
            match (a.is_empty(), b.is_empty()) {
                (true, true) => return Ordering::Equal,
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                (false, false) => {}
            }
            let (Some((fa, ra)), Some((fb, rb))) =
                (Self::split_field(ty, a), Self::split_field(ty, b))
            else {
                return a.cmp(b);
            };
            match fa.cmp(fb) {
                Ordering::Equal => {
                    a = ra;
                    b = rb;
                }
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }
}
