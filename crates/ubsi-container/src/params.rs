//! 参数声明与实参对齐。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 调用方可能少传尾部参数，或以参数名传参；接口实现只应看到与声明逐一对齐的实参列表。
//!
//! ## 逻辑 (How)
//! 1. 请求头携带命名参数表且未按位置传参时，按声明顺序逐个取名；
//! 2. 否则按位置对齐：多传报错，少传的尾部参数取默认字面量；
//! 3. 默认字面量按 JSON 解析后转换到声明形态，非 JSON 文本视为字符串。
//!
//! ## 契约 (What)
//! - 既无实参又无默认值的参数、无法转换到声明形态的默认值都返回 [`ResultCode::PARAMS`]。

use std::str::FromStr;
use ubsi_core::registry::HEADER_REQ_PARAMS;
use ubsi_core::{HeaderMap, ObjectId, ResultCode, ResultError, Value};

/// 参数或返回值的声明形态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueShape {
    #[default]
    Any,
    Bool,
    Byte,
    Int,
    Long,
    BigInt,
    Double,
    Decimal,
    Bytes,
    Str,
    List,
    Set,
    Array,
    Map,
    Id,
}

impl ValueShape {
    /// 把值转换到当前形态。
    pub fn coerce(self, value: Value) -> Result<Value, String> {
        let kind = value.kind();
        let mismatch = || format!("cannot convert {kind} to {self:?}");
        match self {
            ValueShape::Any => Ok(value),
            ValueShape::Bool => match &value {
                Value::Bool(_) => Ok(value),
                Value::Str(s) => bool::from_str(s).map(Value::Bool).map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            ValueShape::Byte => integer(&value)
                .and_then(|n| i8::try_from(n).ok())
                .map(Value::Byte)
                .ok_or_else(mismatch),
            ValueShape::Int => integer(&value)
                .and_then(|n| i32::try_from(n).ok())
                .map(Value::Int)
                .ok_or_else(mismatch),
            ValueShape::Long => integer(&value).map(Value::Long).ok_or_else(mismatch),
            ValueShape::BigInt => match &value {
                Value::BigInt(_) => Ok(value),
                Value::Str(s) if is_integer_text(s) => Ok(Value::BigInt(s.clone())),
                _ => integer(&value)
                    .map(|n| Value::BigInt(n.to_string()))
                    .ok_or_else(mismatch),
            },
            ValueShape::Double => value.as_f64().map(Value::Double).ok_or_else(mismatch),
            ValueShape::Decimal => match &value {
                Value::Decimal(_) => Ok(value),
                Value::Str(s) if f64::from_str(s).is_ok() => Ok(Value::Decimal(s.clone())),
                Value::Byte(_) | Value::Int(_) | Value::Long(_) | Value::BigInt(_) => integer(&value)
                    .map(|n| Value::Decimal(n.to_string()))
                    .ok_or_else(mismatch),
                Value::Double(d) => Ok(Value::Decimal(d.to_string())),
                _ => Err(mismatch()),
            },
            ValueShape::Bytes => match value {
                Value::Bytes(_) => Ok(value),
                Value::Str(s) => Ok(Value::Bytes(s.into_bytes().into())),
                _ => Err(mismatch()),
            },
            ValueShape::Str => match value {
                Value::Str(_) => Ok(value),
                Value::Bool(_)
                | Value::Byte(_)
                | Value::Int(_)
                | Value::Long(_)
                | Value::Double(_) => Ok(Value::Str(scalar_text(&value))),
                Value::BigInt(s) | Value::Decimal(s) => Ok(Value::Str(s)),
                _ => Err(mismatch()),
            },
            ValueShape::List => sequence(value, Value::List).ok_or_else(mismatch),
            ValueShape::Set => sequence(value, Value::Set).ok_or_else(mismatch),
            ValueShape::Array => sequence(value, Value::Array).ok_or_else(mismatch),
            ValueShape::Map => match value {
                Value::Map(_) => Ok(value),
                _ => Err(mismatch()),
            },
            ValueShape::Id => match &value {
                Value::Id(_) => Ok(value),
                Value::Str(s) => ObjectId::parse_hex(s).map(Value::Id).ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
        }
    }

    /// 解析默认字面量。
    pub fn parse_literal(self, literal: &str) -> Result<Value, String> {
        let trimmed = literal.trim();
        match self {
            ValueShape::BigInt if is_integer_text(trimmed) => {
                return Ok(Value::BigInt(trimmed.to_owned()));
            }
            ValueShape::Decimal if f64::from_str(trimmed).is_ok() => {
                return Ok(Value::Decimal(trimmed.to_owned()));
            }
            _ => {}
        }
        let value = match serde_json::from_str::<serde_json::Value>(literal) {
            Ok(json) => Value::from_json(json),
            Err(_) => Value::Str(literal.to_owned()),
        };
        match (self, value) {
            // 字符串形态下保持字面量原文，例如 "007"
            (ValueShape::Str, Value::Byte(_) | Value::Int(_) | Value::Long(_) | Value::Double(_)) => {
                Ok(Value::Str(literal.to_owned()))
            }
            (shape, value) => shape.coerce(value),
        }
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Byte(_) | Value::Int(_) | Value::Long(_) => value.as_i64(),
        Value::BigInt(s) | Value::Str(s) => i64::from_str(s).ok(),
        _ => None,
    }
}

fn is_integer_text(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Double(d) => d.to_string(),
        other => other.as_i64().map(|n| n.to_string()).unwrap_or_default(),
    }
}

fn sequence(value: Value, wrap: fn(Vec<Value>) -> Value) -> Option<Value> {
    match value {
        Value::List(items) | Value::Set(items) | Value::Array(items) => Some(wrap(items)),
        _ => None,
    }
}

/// 一个参数的声明。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub name: String,
    pub shape: ValueShape,
    /// 默认字面量。
    pub default: Option<String>,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>, shape: ValueShape) -> Self {
        Self {
            name: name.into(),
            shape,
            default: None,
        }
    }

    pub fn default_literal(mut self, literal: impl Into<String>) -> Self {
        self.default = Some(literal.into());
        self
    }

    fn default_value(&self) -> Result<Value, ResultError> {
        let Some(literal) = &self.default else {
            return Err(params_error(format!("parameter `{}` is missing", self.name)));
        };
        self.shape
            .parse_literal(literal)
            .map_err(|reason| params_error(format!("default of `{}`: {reason}", self.name)))
    }
}

/// 把实参与声明对齐。
pub(crate) fn reconcile(
    declared: &[ParamDescriptor],
    supplied: Vec<Value>,
    header: &HeaderMap,
) -> Result<Vec<Value>, ResultError> {
    if supplied.is_empty()
        && let Some(named) = header.get(HEADER_REQ_PARAMS).filter(|v| v.as_map().is_some())
    {
        return declared
            .iter()
            .map(|param| match named.get(&param.name) {
                Some(value) => Ok(value.clone()),
                None => param.default_value(),
            })
            .collect();
    }

    if supplied.len() > declared.len() {
        return Err(params_error(format!(
            "expected at most {} parameters, got {}",
            declared.len(),
            supplied.len()
        )));
    }
    let given = supplied.len();
    let mut params = supplied;
    for param in &declared[given..] {
        params.push(param.default_value()?);
    }
    Ok(params)
}

fn params_error(message: String) -> ResultError {
    ResultError::new(ResultCode::PARAMS, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor::new("name", ValueShape::Str),
            ParamDescriptor::new("count", ValueShape::Int).default_literal("5"),
            ParamDescriptor::new("tags", ValueShape::Set).default_literal(r#"["a","b"]"#),
        ]
    }

    #[test]
    fn trailing_defaults_are_filled_in_declared_shape() {
        let params = reconcile(&declared(), vec![Value::from("x")], &HeaderMap::new()).unwrap();
        assert_eq!(
            params,
            vec![
                Value::from("x"),
                Value::Int(5),
                Value::Set(vec![Value::from("a"), Value::from("b")]),
            ]
        );
    }

    #[test]
    fn count_mismatch_is_a_params_error() {
        let err = reconcile(&declared(), Vec::new(), &HeaderMap::new()).unwrap_err();
        assert_eq!(err.code, ResultCode::PARAMS);

        let too_many = vec![Value::Null; 4];
        let err = reconcile(&declared(), too_many, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.code, ResultCode::PARAMS);
    }

    #[test]
    fn named_params_come_from_header() {
        let header = HeaderMap::from([(
            HEADER_REQ_PARAMS.to_owned(),
            Value::string_map([("count", Value::Int(9)), ("name", Value::from("n"))]),
        )]);
        let params = reconcile(&declared(), Vec::new(), &header).unwrap();
        assert_eq!(params[0], Value::from("n"));
        assert_eq!(params[1], Value::Int(9));
        assert_eq!(params[2].kind(), Value::Set(Vec::new()).kind());
    }

    #[test]
    fn literals_follow_shape() {
        assert_eq!(ValueShape::Str.parse_literal("007").unwrap(), Value::from("007"));
        assert_eq!(ValueShape::Str.parse_literal("plain").unwrap(), Value::from("plain"));
        assert_eq!(ValueShape::Long.parse_literal("42").unwrap(), Value::Long(42));
        assert_eq!(ValueShape::Bool.parse_literal("true").unwrap(), Value::Bool(true));
        assert_eq!(
            ValueShape::BigInt.parse_literal("123456789012345678901234").unwrap(),
            Value::BigInt("123456789012345678901234".into())
        );
        assert!(ValueShape::Int.parse_literal("abc").is_err());
        assert!(ValueShape::Byte.parse_literal("300").is_err());
    }
}
