//! 动态值模型。
//!
//! # 教案级注释
//!
//! - **意图 (Why)**：线协议承载的是“任意类型”的动态数据；以显式的标签联合体 [`Value`]
//!   表达，使编解码器可以按变体一一映射类型标签，调用方也能在编译期穷举处理。
//! - **契约 (What)**：
//!   - 变体与线协议类型 ID 一一对应（见 [`crate::codec::tag`]）；
//!   - 容器变体（`List`/`Set`/`Array`/`Map`）拥有其元素；`Map` 以有序键值对保存，
//!     以便承载 `Double` 等无法实现 `Hash`/`Eq` 的键，并保证编码顺序稳定；
//!   - 一旦编码即视为不可变。
//! - **注意事项 (Trade-offs)**：`Double(NaN)` 与自身不相等，这是 `f64` 的固有语义。

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 对象 ID 的固定字节长度。
pub const OBJECT_ID_LEN: usize = 12;

/// 12 字节不透明 ID：4 字节秒级时间戳（大端）+ 5 字节随机数 + 3 字节递增计数。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// 以原始字节构造。
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// 生成一个新的对象 ID。
    pub fn generate() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let random = uuid::Uuid::new_v4();
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&random.as_bytes()[..5]);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    /// 读取原始字节。
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// 尝试从任意长度切片构造，长度不符时返回 `None`。
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        <[u8; OBJECT_ID_LEN]>::try_from(slice).ok().map(Self)
    }

    /// 解析 24 位十六进制文本。
    pub fn parse_hex(text: &str) -> Option<Self> {
        let raw = hex::decode(text).ok()?;
        Self::from_slice(&raw)
    }

    /// 输出 24 位小写十六进制文本。
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 线协议承载的动态值。
///
/// 变体顺序与类型 ID 保持一致：`Null`=0 … `Pattern`=15。
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Int(i32),
    Long(i64),
    /// 任意精度整数，以十进制文本承载。
    BigInt(String),
    Double(f64),
    /// 任意精度小数，以十进制文本承载。
    Decimal(String),
    Bytes(Bytes),
    Str(String),
    List(Vec<Value>),
    Set(Vec<Value>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Id(ObjectId),
    /// 正则表达式文本及其标志位。
    Pattern { pattern: String, flags: i32 },
}

impl Value {
    /// 以字符串键构造 `Map`。
    pub fn string_map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), v))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// 变体名称，用于错误文案与日志字段。
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::BigInt(_) => "bigint",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Id(_) => "id",
            Value::Pattern { .. } => "pattern",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 将整数类变体统一读取为 `i64`。
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// 读取序列类变体（`List`/`Set`/`Array`）的元素。
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) | Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// 在 `Map` 中按字符串键查找。
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// 将 JSON 文档转换为值模型。
    ///
    /// 数字优先落入 `Int`，其次 `Long`，超出 `i64` 的无符号整数落入 `BigInt`，其余为 `Double`。
    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i).map_or(Value::Long(i), Value::Int)
                } else if let Some(u) = n.as_u64() {
                    Value::BigInt(u.to_string())
                } else {
                    Value::Double(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (Value::Str(k), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Byte(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::Id(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_hex_roundtrip() {
        let id = ObjectId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 24);
        assert_eq!(ObjectId::parse_hex(&hex), Some(id));
        assert_eq!(ObjectId::parse_hex("zz"), None);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn map_lookup_by_string_key() {
        let map = Value::string_map([("a", Value::Int(1)), ("b", Value::from("x"))]);
        assert_eq!(map.get("b"), Some(&Value::Str("x".into())));
        assert_eq!(map.get("c"), None);
        assert_eq!(Value::Null.get("a"), None);
    }

    #[test]
    fn json_numbers_pick_narrowest_variant() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"small":7,"big":5000000000,"huge":18446744073709551615,"f":1.5,"l":[true,null]}"#)
                .expect("valid json");
        let value = Value::from_json(json);
        assert_eq!(value.get("small"), Some(&Value::Int(7)));
        assert_eq!(value.get("big"), Some(&Value::Long(5_000_000_000)));
        assert_eq!(
            value.get("huge"),
            Some(&Value::BigInt("18446744073709551615".into()))
        );
        assert_eq!(value.get("f"), Some(&Value::Double(1.5)));
        assert_eq!(
            value.get("l"),
            Some(&Value::List(vec![Value::Bool(true), Value::Null]))
        );
    }
}
