//! 注册表数据模型：容器注册记录、心跳通知与版本约束。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 容器把“自己托管了哪些服务、当前负载如何”写入后端存储的哈希表，
//!   并通过发布订阅广播轻量心跳；调用端据此构建路由快照。
//! - 记录本身以编解码器的 `Map` 形式存储，字段名保持稳定，保证异构实现可互读。
//!
//! ## 契约 (What)
//! - 哈希键 [`REGISTRY_KEY`]，字段名为容器名 `host#port`；
//! - 通知通道 [`NOTIFY_CHANNEL`] 上的文本消息遵循 [`Heartbeat`] 语法；
//! - 时间戳单位为毫秒，读取方会将其归一化到本地时钟。

use crate::codec::{self, DecodeError, EncodeError};
use crate::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// 容器注册记录所在的哈希键。
pub const REGISTRY_KEY: &str = "_ubsi_container_";
/// 心跳/变更/关闭通知以及消息投递应答共用的通道。
pub const NOTIFY_CHANNEL: &str = "_ubsi_notify_";
/// 单例启动锁的键前缀。
pub const SINGLETON_LOCK_PREFIX: &str = "_ubsi_lock_ss_";
/// 按参数名传参的请求头键。
pub const HEADER_REQ_PARAMS: &str = "_ubsi_req_params_";
/// 转发路径的请求头键。
pub const HEADER_REQ_FORWARD: &str = "_ubsi_req_forward_";

/// 心跳接收窗口（毫秒）：超过该时长未收到心跳即视为失联。
pub const BEATHEART_RECV_MS: i64 = 10_000;
/// 心跳发送间隔（毫秒）。
pub const BEATHEART_SEND_MS: i64 = 3_000;

/// 组合容器名 `host#port`。
pub fn container_name(host: &str, port: u16) -> String {
    format!("{host}#{port}")
}

/// 拆分容器名，非法时返回 `None`。
pub fn parse_container_name(name: &str) -> Option<(&str, u16)> {
    let (host, port) = name.rsplit_once('#')?;
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// 服务状态：已停止。
pub const STATUS_STOPPED: i32 = 0;
/// 服务状态：运行中。
pub const STATUS_RUNNING: i32 = 1;
/// 服务状态：已暂停。
pub const STATUS_PAUSED: i32 = -1;
/// 服务状态：等待单例启动。
pub const STATUS_SINGLETON_WAITING: i32 = -2;

/// 过滤器状态记录。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRecord {
    pub class_name: String,
    pub version: u32,
    pub release: bool,
    pub status: i32,
    /// 是否存在已超时仍在处理的请求。
    pub timeout: bool,
}

/// 服务状态记录。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    /// 服务实现的标识；转发门服务为空串。
    pub class_name: String,
    pub version: u32,
    pub release: bool,
    pub status: i32,
    pub timeout: bool,
    pub deal: u64,
    pub singleton: bool,
}

/// 容器注册记录。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRecord {
    pub gateway: bool,
    pub overload: u32,
    pub waiting: u32,
    pub deal: u64,
    /// 毫秒时间戳；小于等于 0 表示已失效。
    pub timestamp: i64,
    pub services: BTreeMap<String, ServiceRecord>,
    pub filters: Vec<FilterRecord>,
}

impl ContainerRecord {
    /// 判断记录是否失效：时间戳无效，或在存储可用时超过心跳接收窗口。
    pub fn is_invalid(&self, now_ms: i64, store_active: bool) -> bool {
        self.timestamp <= 0 || (store_active && now_ms - self.timestamp > BEATHEART_RECV_MS)
    }

    pub fn to_value(&self) -> Value {
        let services = self
            .services
            .iter()
            .map(|(name, srv)| {
                (
                    Value::Str(name.clone()),
                    Value::string_map([
                        ("ClassName", Value::Str(srv.class_name.clone())),
                        ("Version", Value::Int(srv.version as i32)),
                        ("Release", Value::Bool(srv.release)),
                        ("Status", Value::Int(srv.status)),
                        ("Timeout", Value::Bool(srv.timeout)),
                        ("Deal", Value::Long(srv.deal as i64)),
                        ("Singleton", Value::Int(i32::from(srv.singleton))),
                    ]),
                )
            })
            .collect();
        let filters = self
            .filters
            .iter()
            .map(|f| {
                Value::string_map([
                    ("ClassName", Value::Str(f.class_name.clone())),
                    ("Version", Value::Int(f.version as i32)),
                    ("Release", Value::Bool(f.release)),
                    ("Status", Value::Int(f.status)),
                    ("Timeout", Value::Bool(f.timeout)),
                ])
            })
            .collect();
        Value::string_map([
            ("Gateway", Value::Bool(self.gateway)),
            ("Overload", Value::Int(self.overload as i32)),
            ("Waiting", Value::Int(self.waiting as i32)),
            ("Deal", Value::Long(self.deal as i64)),
            ("Timestamp", Value::Long(self.timestamp)),
            ("Services", Value::Map(services)),
            ("Filters", Value::List(filters)),
        ])
    }

    /// 宽松读取：缺失字段取默认值，类型不符视为缺失。
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        if value.as_map().is_none() {
            return Err(DecodeError::InvalidEnvelope {
                reason: "container record must be a map",
            });
        }
        let services = value
            .get("Services")
            .and_then(Value::as_map)
            .unwrap_or_default()
            .iter()
            .filter_map(|(name, srv)| {
                let name = name.as_str()?;
                Some((
                    name.to_owned(),
                    ServiceRecord {
                        class_name: str_field(srv, "ClassName"),
                        version: int_field(srv, "Version") as u32,
                        release: bool_field(srv, "Release"),
                        status: int_field(srv, "Status") as i32,
                        timeout: bool_field(srv, "Timeout"),
                        deal: int_field(srv, "Deal") as u64,
                        singleton: int_field(srv, "Singleton") != 0 || bool_field(srv, "Singleton"),
                    },
                ))
            })
            .collect();
        let filters = value
            .get("Filters")
            .and_then(Value::as_seq)
            .unwrap_or_default()
            .iter()
            .map(|f| FilterRecord {
                class_name: str_field(f, "ClassName"),
                version: int_field(f, "Version") as u32,
                release: bool_field(f, "Release"),
                status: int_field(f, "Status") as i32,
                timeout: bool_field(f, "Timeout"),
            })
            .collect();
        Ok(Self {
            gateway: bool_field(value, "Gateway"),
            overload: int_field(value, "Overload").max(0) as u32,
            waiting: int_field(value, "Waiting").max(0) as u32,
            deal: int_field(value, "Deal").max(0) as u64,
            timestamp: int_field(value, "Timestamp"),
            services,
            filters,
        })
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        codec::encode(&self.to_value())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(&codec::decode(bytes)?)
    }
}

fn str_field(map: &Value, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn int_field(map: &Value, key: &str) -> i64 {
    map.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn bool_field(map: &Value, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or_default()
}

/// 通知通道上的一条心跳文本。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub container: String,
    pub signal: HeartbeatSignal,
}

/// 心跳载荷。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSignal {
    /// 仅存活，等待数为 0（`name`）。
    Alive,
    /// 存活并携带等待数（`name|N`）。
    Waiting(u32),
    /// 记录已变更，需全量重载（`name|+`）。
    Changed,
    /// 容器已关闭（`name|-`）。
    Closed,
}

impl Heartbeat {
    pub fn new(container: impl Into<String>, signal: HeartbeatSignal) -> Self {
        Self {
            container: container.into(),
            signal,
        }
    }

    /// 按等待数构造：0 时退化为纯存活心跳。
    pub fn waiting(container: impl Into<String>, waiting: u32) -> Self {
        let signal = if waiting == 0 {
            HeartbeatSignal::Alive
        } else {
            HeartbeatSignal::Waiting(waiting)
        };
        Self::new(container, signal)
    }

    /// 解析心跳文本；无法识别的载荷按纯存活处理，空名返回 `None`。
    pub fn parse(text: &str) -> Option<Self> {
        let (name, payload) = match text.split_once('|') {
            Some((name, payload)) => (name, Some(payload)),
            None => (text, None),
        };
        if name.is_empty() {
            return None;
        }
        let signal = match payload {
            None => HeartbeatSignal::Alive,
            Some("+") => HeartbeatSignal::Changed,
            Some("-") => HeartbeatSignal::Closed,
            Some(n) => n
                .trim()
                .parse::<u32>()
                .map_or(HeartbeatSignal::Alive, HeartbeatSignal::Waiting),
        };
        Some(Self::new(name, signal))
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            HeartbeatSignal::Alive => f.write_str(&self.container),
            HeartbeatSignal::Waiting(n) => write!(f, "{}|{n}", self.container),
            HeartbeatSignal::Changed => write!(f, "{}|+", self.container),
            HeartbeatSignal::Closed => write!(f, "{}|-", self.container),
        }
    }
}

/// 版本约束：`min`/`max` 为 0 表示不限，`release` 为 `None` 表示不区分。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionRange {
    pub min: u32,
    pub max: u32,
    pub release: Option<bool>,
}

impl VersionRange {
    pub const ANY: Self = Self {
        min: 0,
        max: 0,
        release: None,
    };

    /// 判断某个具体版本是否满足约束。
    pub fn accepts(&self, version: u32, release: bool) -> bool {
        if self.min > 0 && version < self.min {
            return false;
        }
        if self.max > 0 && version > self.max {
            return false;
        }
        self.release.is_none_or(|r| r == release)
    }

    /// 判断本约束（请求方）是否落在路由项声明的约束之内。
    pub fn within(&self, route: &VersionRange) -> bool {
        if self.min > 0 && route.min > 0 && self.min < route.min {
            return false;
        }
        if self.max > 0 && route.max > 0 && self.max > route.max {
            return false;
        }
        match (self.release, route.release) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContainerRecord {
        let mut record = ContainerRecord {
            gateway: true,
            overload: 100,
            waiting: 3,
            deal: 42,
            timestamp: 1_700_000_000_000,
            ..Default::default()
        };
        record.services.insert(
            "echo".into(),
            ServiceRecord {
                class_name: "demo.Echo".into(),
                version: 1_002_003,
                release: true,
                status: STATUS_RUNNING,
                timeout: false,
                deal: 9,
                singleton: true,
            },
        );
        record.filters.push(FilterRecord {
            class_name: "demo.Audit".into(),
            version: 1_000_000,
            release: false,
            status: STATUS_PAUSED,
            timeout: true,
        });
        record
    }

    #[test]
    fn record_survives_store_encoding() {
        let record = sample();
        let bytes = record.encode().expect("encode");
        assert_eq!(ContainerRecord::decode(&bytes).expect("decode"), record);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let value = Value::string_map([("Overload", Value::Int(50))]);
        let record = ContainerRecord::from_value(&value).unwrap();
        assert_eq!(record.overload, 50);
        assert!(record.services.is_empty());
        assert!(record.is_invalid(0, false));
    }

    #[test]
    fn staleness_only_counts_with_store() {
        let record = sample();
        let late = record.timestamp + BEATHEART_RECV_MS + 1;
        assert!(record.is_invalid(late, true));
        assert!(!record.is_invalid(late, false));
    }

    #[test]
    fn heartbeat_text_forms() {
        for (text, signal) in [
            ("h#1", HeartbeatSignal::Alive),
            ("h#1|7", HeartbeatSignal::Waiting(7)),
            ("h#1|+", HeartbeatSignal::Changed),
            ("h#1|-", HeartbeatSignal::Closed),
        ] {
            let hb = Heartbeat::parse(text).expect("parse");
            assert_eq!(hb, Heartbeat::new("h#1", signal));
            assert_eq!(hb.to_string(), text);
        }
        assert_eq!(Heartbeat::parse(""), None);
        assert_eq!(Heartbeat::waiting("h#1", 0).to_string(), "h#1");
    }

    #[test]
    fn container_name_parsing() {
        assert_eq!(container_name("10.0.0.1", 7112), "10.0.0.1#7112");
        assert_eq!(parse_container_name("10.0.0.1#7112"), Some(("10.0.0.1", 7112)));
        assert_eq!(parse_container_name("#7112"), None);
        assert_eq!(parse_container_name("host"), None);
    }

    #[test]
    fn version_range_checks() {
        let range = VersionRange {
            min: 2_000_000,
            max: 3_000_000,
            release: Some(true),
        };
        assert!(range.accepts(2_500_000, true));
        assert!(!range.accepts(1_000_000, true));
        assert!(!range.accepts(2_500_000, false));
        assert!(VersionRange::ANY.accepts(0, false));

        let route = VersionRange {
            min: 2_000_000,
            ..VersionRange::ANY
        };
        assert!(!VersionRange { min: 1, ..VersionRange::ANY }.within(&route));
        assert!(VersionRange { min: 2_000_001, ..VersionRange::ANY }.within(&route));
        assert!(VersionRange::ANY.within(&route));
    }
}
