//! Order-preserving binary key codec
//!
//! A binary key is the concatenation of its encoded fields, in schema
//! order. Integer fields use a length-prefixed big-endian encoding whose
//! byte-wise comparison matches numeric comparison for non-negative values
//! (a longer minimal encoding is always a larger number, and equal lengths
//! compare big-endian). String fields are u16-length-prefixed except in the
//! last position, where the raw remainder of the key is the value.
//!
//! Decoding reverses field by field and must consume the input exactly;
//! trailing bytes are a corruption signal. Partial keys (a strict prefix of
//! the schema) may be encoded for scan bounds; the decoder does not accept
//! them.

use crate::error::{Error, Result};
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Kind of one key field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Non-negative integer, order-preserving in every position
    Int,
    /// UTF-8 string; raw bytes when last, length-prefixed otherwise
    Str,
}

/// Encoder/decoder for one key schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCodec {
    kinds: Vec<FieldKind>,
}

impl KeyCodec {
    /// Codec over an ordered list of field kinds
    pub fn new(kinds: Vec<FieldKind>) -> Self {
        KeyCodec { kinds }
    }

    /// The standard data-sequence codec: a single integer id
    pub fn id_only() -> Self {
        KeyCodec::new(vec![FieldKind::Int])
    }

    /// Number of fields in the schema
    pub fn arity(&self) -> usize {
        self.kinds.len()
    }

    /// Encode a full key; `values.len()` must equal the schema arity
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.kinds.len() {
            return Err(Error::Codec(format!(
                "expected {} key fields, got {}",
                self.kinds.len(),
                values.len()
            )));
        }
        self.encode_prefix(values)
    }

    /// Encode a leading subset of the schema (for scan bounds).
    ///
    /// The last-position string treatment applies only when the prefix
    /// covers the whole schema.
    pub fn encode_prefix(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() > self.kinds.len() {
            return Err(Error::Codec(format!(
                "prefix of {} fields exceeds schema arity {}",
                values.len(),
                self.kinds.len()
            )));
        }
        let mut out = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let last = i + 1 == self.kinds.len();
            match self.kinds[i] {
                FieldKind::Int => {
                    let n = int_field(value)?;
                    let buf = encode_int(n);
                    out.extend_from_slice(&buf);
                }
                FieldKind::Str => {
                    let s = value.as_str().ok_or_else(|| {
                        Error::Codec(format!("field {}: expected string, got {:?}", i, value))
                    })?;
                    if last {
                        out.extend_from_slice(s.as_bytes());
                    } else {
                        let len = s.len();
                        if len > u16::MAX as usize {
                            return Err(Error::Codec(format!(
                                "field {}: string of {} bytes exceeds the non-last limit",
                                i, len
                            )));
                        }
                        let mut prefix = [0u8; 2];
                        BigEndian::write_u16(&mut prefix, len as u16);
                        out.extend_from_slice(&prefix);
                        out.extend_from_slice(s.as_bytes());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Decode a full key, consuming the input exactly
    pub fn decode(&self, mut bytes: &[u8]) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(self.kinds.len());
        for (i, kind) in self.kinds.iter().enumerate() {
            let last = i + 1 == self.kinds.len();
            match kind {
                FieldKind::Int => {
                    let (n, rest) = decode_int(bytes)
                        .map_err(|msg| Error::Codec(format!("field {}: {}", i, msg)))?;
                    out.push(Value::Int(n as i64));
                    bytes = rest;
                }
                FieldKind::Str => {
                    if last {
                        let s = std::str::from_utf8(bytes)
                            .map_err(|_| Error::Codec(format!("field {}: invalid UTF-8", i)))?;
                        out.push(Value::Str(s.to_string()));
                        bytes = &[];
                    } else {
                        if bytes.len() < 2 {
                            return Err(Error::Codec(format!(
                                "field {}: truncated string length",
                                i
                            )));
                        }
                        let len = BigEndian::read_u16(&bytes[..2]) as usize;
                        let rest = &bytes[2..];
                        if rest.len() < len {
                            return Err(Error::Codec(format!(
                                "field {}: truncated string body",
                                i
                            )));
                        }
                        let s = std::str::from_utf8(&rest[..len])
                            .map_err(|_| Error::Codec(format!("field {}: invalid UTF-8", i)))?;
                        out.push(Value::Str(s.to_string()));
                        bytes = &rest[len..];
                    }
                }
            }
        }
        if !bytes.is_empty() {
            return Err(Error::Codec(format!(
                "{} trailing bytes after the last field",
                bytes.len()
            )));
        }
        Ok(out)
    }
}

/// Encode a single id as a data-sequence key
pub fn encode_id(id: u64) -> Vec<u8> {
    encode_int(id).to_vec()
}

/// Decode a data-sequence key back to an id
pub fn decode_id(bytes: &[u8]) -> Result<u64> {
    let (n, rest) = decode_int(bytes).map_err(Error::Codec)?;
    if !rest.is_empty() {
        return Err(Error::Codec(format!(
            "{} trailing bytes after the id",
            rest.len()
        )));
    }
    Ok(n)
}

/// Integer value of a key field; references encode as their target id
fn int_field(value: &Value) -> Result<u64> {
    match value {
        Value::Int(i) if *i >= 0 => Ok(*i as u64),
        Value::Int(i) => Err(Error::Codec(format!(
            "negative integer {} is not encodable as a key field",
            i
        ))),
        Value::Ref(id) => Ok(*id),
        other => Err(Error::Codec(format!(
            "expected integer key field, got {:?}",
            other
        ))),
    }
}

/// Length byte followed by the minimal big-endian representation.
///
/// `0 -> [0]`, `7 -> [1, 7]`, `300 -> [2, 1, 44]`. Byte-wise comparison
/// preserves numeric order: unequal lengths order by magnitude, equal
/// lengths order big-endian.
fn encode_int(n: u64) -> SmallVec<[u8; 9]> {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, n);
    let skip = buf.iter().take_while(|&&b| b == 0).count();
    let body = &buf[skip..];
    let mut out = SmallVec::new();
    out.push(body.len() as u8);
    out.extend_from_slice(body);
    out
}

fn decode_int(bytes: &[u8]) -> std::result::Result<(u64, &[u8]), String> {
    let Some((&len, rest)) = bytes.split_first() else {
        return Err("truncated integer length".into());
    };
    let len = len as usize;
    if len > 8 {
        return Err(format!("integer length byte {} exceeds 8", len));
    }
    if rest.len() < len {
        return Err("truncated integer body".into());
    }
    let mut buf = [0u8; 8];
    buf[8 - len..].copy_from_slice(&rest[..len]);
    Ok((BigEndian::read_u64(&buf), &rest[len..]))
}

/// Tightest exclusive upper bound for keys starting with `prefix`.
///
/// `None` means the scan is unbounded above (the prefix is all 0xFF).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec_ii() -> KeyCodec {
        KeyCodec::new(vec![FieldKind::Int, FieldKind::Int])
    }

    #[test]
    fn test_int_encoding_shape() {
        assert_eq!(encode_int(0).as_slice(), &[0][..]);
        assert_eq!(encode_int(7).as_slice(), &[1, 7][..]);
        assert_eq!(encode_int(300).as_slice(), &[2, 1, 44][..]);
    }

    #[test]
    fn test_int_order_preserved() {
        let samples = [0u64, 1, 7, 127, 128, 255, 256, 300, 65_535, 65_536, u64::MAX];
        for a in samples {
            for b in samples {
                let ea = encode_int(a);
                let eb = encode_int(b);
                assert_eq!(
                    a.cmp(&b),
                    ea.as_slice().cmp(eb.as_slice()),
                    "order broken for {} vs {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_round_trip_two_ints() {
        let codec = codec_ii();
        let values = vec![Value::Int(7), Value::Int(1000)];
        let bytes = codec.encode(&values).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), values);
    }

    #[test]
    fn test_round_trip_with_last_string() {
        let codec = KeyCodec::new(vec![FieldKind::Int, FieldKind::Str]);
        let values = vec![Value::Int(3), Value::Str("hello world".into())];
        let bytes = codec.encode(&values).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), values);
    }

    #[test]
    fn test_round_trip_middle_string() {
        let codec = KeyCodec::new(vec![FieldKind::Str, FieldKind::Int]);
        let values = vec![Value::Str("café".into()), Value::Int(12)];
        let bytes = codec.encode(&values).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), values);
    }

    #[test]
    fn test_ref_encodes_as_target_id() {
        let codec = codec_ii();
        let via_ref = codec.encode(&[Value::Ref(7), Value::Int(1)]).unwrap();
        let via_int = codec.encode(&[Value::Int(7), Value::Int(1)]).unwrap();
        assert_eq!(via_ref, via_int);
    }

    #[test]
    fn test_negative_int_rejected() {
        let codec = KeyCodec::id_only();
        assert!(codec.encode(&[Value::Int(-1)]).is_err());
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let codec = codec_ii();
        assert!(codec.encode(&[Value::Int(1)]).is_err());
        assert!(codec
            .encode(&[Value::Int(1), Value::Int(2), Value::Int(3)])
            .is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let codec = KeyCodec::id_only();
        let mut bytes = codec.encode(&[Value::Int(7)]).unwrap();
        bytes.push(0);
        assert!(codec.decode(&bytes).is_err());
    }

    #[test]
    fn test_prefix_encoding_is_a_byte_prefix() {
        let codec = codec_ii();
        let full = codec.encode(&[Value::Int(7), Value::Int(9)]).unwrap();
        let prefix = codec.encode_prefix(&[Value::Int(7)]).unwrap();
        assert!(full.starts_with(&prefix));
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(&[1, 7]), Some(vec![1, 8]));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(&[]), None);
    }

    #[test]
    fn test_id_helpers() {
        let bytes = encode_id(1000);
        assert_eq!(decode_id(&bytes).unwrap(), 1000);
        assert!(decode_id(&[1, 7, 0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_id_round_trip(id in 0u64..u64::MAX) {
            prop_assert_eq!(decode_id(&encode_id(id)).unwrap(), id);
        }

        #[test]
        fn prop_id_order_preserved(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            let ea = encode_id(a);
            let eb = encode_id(b);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn prop_mixed_key_round_trip(cat in 0u64..1_000_000, id in 0u64..1_000_000, s in "[a-z]{0,12}") {
            let codec = KeyCodec::new(vec![
                FieldKind::Int,
                FieldKind::Int,
                FieldKind::Str,
            ]);
            let values = vec![
                Value::Int(cat as i64),
                Value::Int(id as i64),
                Value::Str(s),
            ];
            let bytes = codec.encode(&values).unwrap();
            prop_assert_eq!(codec.decode(&bytes).unwrap(), values);
        }
    }
}
