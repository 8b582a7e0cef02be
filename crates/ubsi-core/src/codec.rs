//! 类型标签二进制编解码。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 为 [`Value`] 提供紧凑、自描述的二进制表示，请求/应答信封与注册记录都复用本编码。
//!
//! ## 逻辑 (How)
//! - 每个值以一个标签字节开头：高 4 位为类型 ID，低 4 位为内联长度（0..=7），
//!   或 `8 | n` 表示其后跟随 n（1..=4）个小端长度字节；
//! - `Int`/`Long` 标签低位为 0，其后固定 4/8 个小端字节；`Byte` 其后固定 1 字节；
//! - `Bool` 将取值写入低位；`Null` 即单字节 `0x00`；
//! - 文本类（`BigInt`/`Double`/`Decimal`/`Str`/`Pattern`）写入 UTF-8 字节；
//!   容器类的“长度”是元素个数（`Map` 为键值对个数），随后依次递归编码。
//!
//! ## 契约 (What)
//! - `decode(encode(v)) == v` 对所有非 NaN 值成立；
//! - 未识别的标签、截断输入、非法 UTF-8 等均返回 [`DecodeError`]，绝不 panic；
//! - 嵌套深度超过 [`MAX_DEPTH`] 视为恶意输入并拒绝。

use crate::value::{ObjectId, Value};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 线协议类型 ID（标签字节高 4 位）。
pub mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const BYTE: u8 = 2;
    pub const INT: u8 = 3;
    pub const LONG: u8 = 4;
    pub const BIGINT: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const BIGDEC: u8 = 7;
    pub const BYTES: u8 = 8;
    pub const STR: u8 = 9;
    pub const LIST: u8 = 10;
    pub const SET: u8 = 11;
    pub const ARRAY: u8 = 12;
    pub const MAP: u8 = 13;
    pub const ID: u8 = 14;
    pub const PATTERN: u8 = 15;
}

/// 允许的最大嵌套深度。
pub const MAX_DEPTH: usize = 128;

/// 解码失败原因。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unrecognized tag byte 0x{tag:02x}")]
    UnknownTag { tag: u8 },
    #[error("truncated input: need {needed} more bytes")]
    Truncated { needed: usize },
    #[error("invalid length byte count {count}")]
    InvalidLength { count: u8 },
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    #[error("invalid numeric text `{text}`")]
    InvalidNumber { text: String },
    #[error("object id must be 12 bytes, got {len}")]
    InvalidObjectId { len: usize },
    #[error("{remaining} trailing bytes after value")]
    TrailingBytes { remaining: usize },
    #[error("nesting deeper than {max}")]
    TooDeep { max: usize },
    #[error("invalid frame header 0x{byte:02x}")]
    InvalidFrameHeader { byte: u8 },
    #[error("frame of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: &'static str },
}

/// 编码失败原因：仅在长度超出 4 字节可表示范围时出现。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("length {len} exceeds 32-bit range")]
    LengthOverflow { len: usize },
}

/// 将值编码为独立字节块。
pub fn encode(value: &Value) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// 将值追加编码到既有缓冲。
pub fn encode_into(value: &Value, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match value {
        Value::Null => buf.put_u8(tag::NULL << 4),
        Value::Bool(b) => buf.put_u8((tag::BOOL << 4) | u8::from(*b)),
        Value::Byte(v) => {
            buf.put_u8(tag::BYTE << 4);
            buf.put_i8(*v);
        }
        Value::Int(v) => {
            buf.put_u8(tag::INT << 4);
            buf.put_i32_le(*v);
        }
        Value::Long(v) => {
            buf.put_u8(tag::LONG << 4);
            buf.put_i64_le(*v);
        }
        Value::BigInt(text) => put_blob(buf, tag::BIGINT, text.as_bytes())?,
        Value::Double(v) => put_blob(buf, tag::DOUBLE, double_text(*v).as_bytes())?,
        Value::Decimal(text) => put_blob(buf, tag::BIGDEC, text.as_bytes())?,
        Value::Bytes(bytes) => put_blob(buf, tag::BYTES, bytes)?,
        Value::Str(text) => put_blob(buf, tag::STR, text.as_bytes())?,
        Value::List(items) => put_seq(buf, tag::LIST, items)?,
        Value::Set(items) => put_seq(buf, tag::SET, items)?,
        Value::Array(items) => put_seq(buf, tag::ARRAY, items)?,
        Value::Map(entries) => {
            put_header(buf, tag::MAP, entries.len())?;
            for (k, v) in entries {
                encode_into(k, buf)?;
                encode_into(v, buf)?;
            }
        }
        Value::Id(id) => put_blob(buf, tag::ID, id.as_bytes())?,
        Value::Pattern { pattern, flags } => {
            put_blob(buf, tag::PATTERN, format!("{pattern}/{flags}").as_bytes())?
        }
    }
    Ok(())
}

/// 解码一个完整值，要求输入恰好被消费完。
pub fn decode(input: &[u8]) -> Result<Value, DecodeError> {
    let mut reader = Reader { buf: input, pos: 0 };
    let value = reader.value(0)?;
    let remaining = input.len() - reader.pos;
    if remaining != 0 {
        return Err(DecodeError::TrailingBytes { remaining });
    }
    Ok(value)
}

/// 计算长度所需的字节数（1..=4）。
pub(crate) fn length_byte_count(len: usize) -> u8 {
    if len >= 1 << 24 {
        4
    } else if len >= 1 << 16 {
        3
    } else if len >= 1 << 8 {
        2
    } else {
        1
    }
}

/// 以小端写入 `count` 个长度字节。
pub(crate) fn put_length_le(buf: &mut BytesMut, len: usize, count: u8) {
    for i in 0..count {
        buf.put_u8(((len >> (u32::from(i) * 8)) & 0xff) as u8);
    }
}

fn put_header(buf: &mut BytesMut, type_id: u8, len: usize) -> Result<(), EncodeError> {
    if len <= 7 {
        buf.put_u8((type_id << 4) | len as u8);
        return Ok(());
    }
    if u32::try_from(len).is_err() {
        return Err(EncodeError::LengthOverflow { len });
    }
    let count = length_byte_count(len);
    buf.put_u8((type_id << 4) | 8 | count);
    put_length_le(buf, len, count);
    Ok(())
}

fn put_blob(buf: &mut BytesMut, type_id: u8, bytes: &[u8]) -> Result<(), EncodeError> {
    put_header(buf, type_id, bytes.len())?;
    buf.put_slice(bytes);
    Ok(())
}

fn put_seq(buf: &mut BytesMut, type_id: u8, items: &[Value]) -> Result<(), EncodeError> {
    put_header(buf, type_id, items.len())?;
    for item in items {
        encode_into(item, buf)?;
    }
    Ok(())
}

fn double_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_owned()
    } else if v == f64::INFINITY {
        "Infinity".to_owned()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_owned()
    } else {
        v.to_string()
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if available < n {
            return Err(DecodeError::Truncated {
                needed: n - available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn length(&mut self, nibble: u8) -> Result<usize, DecodeError> {
        if nibble & 0x08 == 0 {
            return Ok(usize::from(nibble));
        }
        let count = nibble & 0x07;
        if !(1..=4).contains(&count) {
            return Err(DecodeError::InvalidLength { count });
        }
        let raw = self.take(usize::from(count))?;
        Ok(raw
            .iter()
            .enumerate()
            .fold(0usize, |acc, (i, b)| acc | (usize::from(*b) << (i * 8))))
    }

    fn blob(&mut self, nibble: u8) -> Result<&'a [u8], DecodeError> {
        let len = self.length(nibble)?;
        self.take(len)
    }

    fn text(&mut self, nibble: u8) -> Result<String, DecodeError> {
        let raw = self.blob(nibble)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    fn items(&mut self, nibble: u8, depth: usize) -> Result<Vec<Value>, DecodeError> {
        let len = self.length(nibble)?;
        // 每个元素至少占 1 字节，先行校验可避免按伪造长度预分配。
        let available = self.buf.len() - self.pos;
        if len > available {
            return Err(DecodeError::Truncated {
                needed: len - available,
            });
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.value(depth + 1)?);
        }
        Ok(items)
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep { max: MAX_DEPTH });
        }
        let head = self.u8()?;
        let nibble = head & 0x0f;
        let value = match head >> 4 {
            tag::NULL => Value::Null,
            tag::BOOL => Value::Bool(nibble != 0),
            tag::BYTE => Value::Byte(self.u8()? as i8),
            tag::INT => {
                let raw = self.take(4)?;
                Value::Int(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            tag::LONG => {
                let raw = self.take(8)?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(raw);
                Value::Long(i64::from_le_bytes(bytes))
            }
            tag::BIGINT => Value::BigInt(self.text(nibble)?),
            tag::DOUBLE => {
                let text = self.text(nibble)?;
                match text.parse::<f64>() {
                    Ok(v) => Value::Double(v),
                    Err(_) => return Err(DecodeError::InvalidNumber { text }),
                }
            }
            tag::BIGDEC => Value::Decimal(self.text(nibble)?),
            tag::BYTES => Value::Bytes(Bytes::copy_from_slice(self.blob(nibble)?)),
            tag::STR => Value::Str(self.text(nibble)?),
            tag::LIST => Value::List(self.items(nibble, depth)?),
            tag::SET => Value::Set(self.items(nibble, depth)?),
            tag::ARRAY => Value::Array(self.items(nibble, depth)?),
            tag::MAP => {
                let len = self.length(nibble)?;
                let available = self.buf.len() - self.pos;
                if len.saturating_mul(2) > available {
                    return Err(DecodeError::Truncated {
                        needed: len.saturating_mul(2) - available,
                    });
                }
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = self.value(depth + 1)?;
                    let v = self.value(depth + 1)?;
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            tag::ID => {
                let raw = self.blob(nibble)?;
                let id = ObjectId::from_slice(raw)
                    .ok_or(DecodeError::InvalidObjectId { len: raw.len() })?;
                Value::Id(id)
            }
            tag::PATTERN => {
                let text = self.text(nibble)?;
                let (pattern, flags) = match text.rsplit_once('/') {
                    Some((p, f)) => match f.parse::<i32>() {
                        Ok(flags) => (p.to_owned(), flags),
                        Err(_) => return Err(DecodeError::InvalidNumber { text: f.to_owned() }),
                    },
                    None => (text, 0),
                };
                Value::Pattern { pattern, flags }
            }
            _ => return Err(DecodeError::UnknownTag { tag: head }),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let bytes = encode(&v).expect("encode");
        assert_eq!(decode(&bytes).expect("decode"), v);
    }

    #[test]
    fn scalar_layouts_match_wire_format() {
        assert_eq!(&encode(&Value::Null).unwrap()[..], &[0x00]);
        assert_eq!(&encode(&Value::Bool(true)).unwrap()[..], &[0x11]);
        assert_eq!(&encode(&Value::Bool(false)).unwrap()[..], &[0x10]);
        assert_eq!(&encode(&Value::Byte(-1)).unwrap()[..], &[0x20, 0xff]);
        assert_eq!(
            &encode(&Value::Int(0x0102_0304)).unwrap()[..],
            &[0x30, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(&encode(&Value::from("ab")).unwrap()[..], &[0x92, b'a', b'b']);
    }

    #[test]
    fn long_lengths_use_extension_nibble() {
        let text = "x".repeat(300);
        let bytes = encode(&Value::Str(text.clone())).unwrap();
        assert_eq!(bytes[0], (tag::STR << 4) | 8 | 2);
        assert_eq!(&bytes[1..3], &[0x2c, 0x01]);
        roundtrip(Value::Str(text));

        let eight = "y".repeat(8);
        let bytes = encode(&Value::Str(eight)).unwrap();
        assert_eq!(&bytes[..2], &[(tag::STR << 4) | 8 | 1, 8]);
    }

    #[test]
    fn special_doubles_survive() {
        roundtrip(Value::Double(f64::INFINITY));
        roundtrip(Value::Double(f64::NEG_INFINITY));
        roundtrip(Value::Double(-0.0));
        roundtrip(Value::Double(1e300));
        let nan = decode(&encode(&Value::Double(f64::NAN)).unwrap()).unwrap();
        assert!(matches!(nan, Value::Double(v) if v.is_nan()));
    }

    #[test]
    fn pattern_keeps_slashes_in_body() {
        roundtrip(Value::Pattern {
            pattern: "a/b/.*".into(),
            flags: 2,
        });
    }

    #[test]
    fn nested_containers_roundtrip() {
        roundtrip(Value::Map(vec![
            (Value::Int(1), Value::Set(vec![Value::Null, Value::Bool(false)])),
            (
                Value::Double(2.5),
                Value::Array(vec![Value::List(vec![]), Value::Id(ObjectId::generate())]),
            ),
        ]));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(decode(&[]), Err(DecodeError::Truncated { needed: 1 }));
        assert_eq!(decode(&[0x30, 0x01]), Err(DecodeError::Truncated { needed: 3 }));
        assert_eq!(decode(&[0x98]), Err(DecodeError::InvalidLength { count: 0 }));
        assert_eq!(decode(&[0x9d]), Err(DecodeError::InvalidLength { count: 5 }));
        assert_eq!(decode(&[0x92, 0xff, 0xfe]), Err(DecodeError::InvalidUtf8));
        assert_eq!(decode(&[0xe1, 0x00]), Err(DecodeError::InvalidObjectId { len: 1 }));
        assert_eq!(decode(&[0x00, 0x00]), Err(DecodeError::TrailingBytes { remaining: 1 }));
        assert!(matches!(
            decode(&[0x63, b'a', b'b', b'c']),
            Err(DecodeError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn forged_container_length_fails_without_allocating() {
        // LIST 长度声明为 0xffffffff，但后续没有任何元素。
        let input = [(tag::LIST << 4) | 8 | 4, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(decode(&input), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn excessive_nesting_is_rejected() {
        let mut input = vec![(tag::LIST << 4) | 1; MAX_DEPTH + 2];
        input.push(0x00);
        assert_eq!(decode(&input), Err(DecodeError::TooDeep { max: MAX_DEPTH }));
    }
}
