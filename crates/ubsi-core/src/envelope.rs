//! 请求/应答信封。
//!
//! # 教案级注释
//!
//! ## 契约 (What)
//! - 请求元组：`[id, header, service, [entry, params...], flags]`，`header` 为空时写 `Null`，
//!   `flags` 以 `Byte` 承载；
//! - 应答元组：`[id, code, data]` 或 `[id, code, data, tailer]`，`code` 以 `Byte` 承载；
//! - 两者外层均为 `Array`，解码时同样接受 `List` 以兼容宽松的发送端。
//!
//! ## 注意事项 (Trade-offs)
//! - `header`/`tailer` 仅保留字符串键，非字符串键在解码时被丢弃。

use crate::code::ResultCode;
use crate::codec::{self, DecodeError, EncodeError};
use crate::frame;
use crate::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

/// 头部/尾部映射。
pub type HeaderMap = BTreeMap<String, Value>;

/// 请求标志位集合。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequestFlags(u8);

impl RequestFlags {
    /// 不需要应答。
    pub const DISCARD: Self = Self(0x01);
    /// 通过共享通知通道投递应答。
    pub const MESSAGE: Self = Self(0x02);
    /// 强制服务端记录访问日志。
    pub const LOG: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for RequestFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestFlags(0x{:02x})", self.0)
    }
}

/// 线上请求。
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub id: String,
    pub header: HeaderMap,
    pub service: String,
    pub entry: String,
    pub params: Vec<Value>,
    pub flags: RequestFlags,
}

impl RequestEnvelope {
    pub fn to_value(&self) -> Value {
        let mut call = Vec::with_capacity(self.params.len() + 1);
        call.push(Value::Str(self.entry.clone()));
        call.extend(self.params.iter().cloned());
        Value::Array(vec![
            Value::Str(self.id.clone()),
            header_to_value(&self.header),
            Value::Str(self.service.clone()),
            Value::Array(call),
            Value::Byte(self.flags.bits() as i8),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut fields = into_tuple(value, "request must be a tuple")?.into_iter();
        let (Some(id), Some(header), Some(service), Some(call), Some(flags)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(invalid("request tuple needs 5 fields"));
        };

        let id = into_string(id, "request id must be a string")?;
        let service = into_string(service, "service must be a string")?;
        let mut call = into_tuple(call, "entry and params must be a tuple")?.into_iter();
        let entry = match call.next() {
            Some(entry) => into_string(entry, "entry must be a string")?,
            None => return Err(invalid("entry is missing")),
        };
        let flags = match flags {
            Value::Byte(b) => RequestFlags::from_bits(b as u8),
            Value::Null => RequestFlags::empty(),
            other => match other.as_i64() {
                Some(v) => RequestFlags::from_bits(v as u8),
                None => return Err(invalid("flags must be a byte")),
            },
        };
        Ok(Self {
            id,
            header: header_from_value(header),
            service,
            entry,
            params: call.collect(),
            flags,
        })
    }

    /// 编码并加帧，得到可直接写出的字节。
    pub fn to_frame(&self) -> Result<Bytes, EncodeError> {
        Ok(frame::frame(&codec::encode(&self.to_value())?))
    }
}

/// 线上应答。
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: String,
    pub code: ResultCode,
    pub data: Value,
    pub tailer: Option<HeaderMap>,
}

impl ResponseEnvelope {
    pub fn new(id: impl Into<String>, code: ResultCode, data: Value) -> Self {
        Self {
            id: id.into(),
            code,
            data,
            tailer: None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut fields = vec![
            Value::Str(self.id.clone()),
            Value::Byte(self.code.raw()),
            self.data.clone(),
        ];
        if let Some(tailer) = &self.tailer {
            fields.push(header_to_value(tailer));
        }
        Value::Array(fields)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut fields = into_tuple(value, "response must be a tuple")?.into_iter();
        let (Some(id), Some(code), Some(data)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid("response tuple needs at least 3 fields"));
        };
        let id = into_string(id, "response id must be a string")?;
        let code = match code.as_i64() {
            Some(raw) => ResultCode::new(raw as i8),
            None => return Err(invalid("result code must be a byte")),
        };
        let tailer = fields
            .next()
            .filter(|v| !v.is_null())
            .map(header_from_value);
        Ok(Self {
            id,
            code,
            data,
            tailer,
        })
    }

    /// 编码（不加帧），用于通知通道的二进制消息。
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        codec::encode(&self.to_value())
    }

    /// 解码不带帧头的应答。
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(codec::decode(bytes)?)
    }

    pub fn to_frame(&self) -> Result<Bytes, EncodeError> {
        Ok(frame::frame(&self.encode()?))
    }
}

fn invalid(reason: &'static str) -> DecodeError {
    DecodeError::InvalidEnvelope { reason }
}

fn into_tuple(value: Value, reason: &'static str) -> Result<Vec<Value>, DecodeError> {
    match value {
        Value::Array(items) | Value::List(items) => Ok(items),
        _ => Err(invalid(reason)),
    }
}

fn into_string(value: Value, reason: &'static str) -> Result<String, DecodeError> {
    match value {
        Value::Str(s) => Ok(s),
        _ => Err(invalid(reason)),
    }
}

fn header_to_value(header: &HeaderMap) -> Value {
    if header.is_empty() {
        return Value::Null;
    }
    Value::Map(
        header
            .iter()
            .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
            .collect(),
    )
}

fn header_from_value(value: Value) -> HeaderMap {
    match value {
        Value::Map(entries) => entries
            .into_iter()
            .filter_map(|(k, v)| match k {
                Value::Str(k) => Some((k, v)),
                _ => None,
            })
            .collect(),
        _ => HeaderMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tuple_layout() {
        let req = RequestEnvelope {
            id: "r1".into(),
            header: HeaderMap::new(),
            service: "echo".into(),
            entry: "echo".into(),
            params: vec![Value::from("hello")],
            flags: RequestFlags::DISCARD | RequestFlags::LOG,
        };
        let value = req.to_value();
        let fields = value.as_seq().expect("tuple");
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[1], Value::Null);
        assert_eq!(
            fields[3],
            Value::Array(vec![Value::from("echo"), Value::from("hello")])
        );
        assert_eq!(fields[4], Value::Byte(0x81u8 as i8));

        let decoded = RequestEnvelope::from_value(value).expect("decode");
        assert_eq!(decoded, req);
        assert!(decoded.flags.contains(RequestFlags::LOG));
        assert!(!decoded.flags.contains(RequestFlags::MESSAGE));
    }

    #[test]
    fn response_tailer_is_optional() {
        let mut resp = ResponseEnvelope::new("r2", ResultCode::TIMEOUT, Value::from("late"));
        let bytes = resp.encode().unwrap();
        assert_eq!(ResponseEnvelope::decode(&bytes).unwrap(), resp);

        resp.tailer = Some(HeaderMap::from([("trace".to_owned(), Value::Int(1))]));
        let bytes = resp.encode().unwrap();
        assert_eq!(ResponseEnvelope::decode(&bytes).unwrap(), resp);
    }

    #[test]
    fn malformed_tuples_are_rejected() {
        assert!(RequestEnvelope::from_value(Value::Array(vec![Value::Null])).is_err());
        assert!(ResponseEnvelope::from_value(Value::from("x")).is_err());
        let missing_entry = Value::Array(vec![
            Value::from("id"),
            Value::Null,
            Value::from("svc"),
            Value::Array(vec![]),
            Value::Byte(0),
        ]);
        assert_eq!(
            RequestEnvelope::from_value(missing_entry),
            Err(DecodeError::InvalidEnvelope {
                reason: "entry is missing"
            })
        );
    }
}
