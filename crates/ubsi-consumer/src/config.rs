//! 调用端配置。
//!
//! 以 TOML 描述，缺失字段取默认值，随后由 [`ConsumerConfig::normalized`] 收敛取值范围：
//!
//! ```toml
//! timeout_connect_secs = 5
//! timeout_request_secs = 10
//! timeout_reconnect_secs = 600
//!
//! [[force_log]]
//! service = "order*"
//!
//! [[route]]
//! service = "echo"
//! nodes = ["127.0.0.1#7112", { addr = "127.0.0.1#7113", weight = 2.0 }]
//! ```

use crate::router::{LocalRoute, RouteNode};
use serde::Deserialize;
use std::time::Duration;
use ubsi_core::config::clamp_range;
use ubsi_core::registry::parse_container_name;
use ubsi_core::util::{match_pattern, parse_version};
use ubsi_core::{UbsiError, VersionRange};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 建连超时（秒）。
    pub timeout_connect_secs: u64,
    /// 默认请求超时（秒），0 表示不限。
    pub timeout_request_secs: u64,
    /// 连接失败后的退避窗口（秒），范围 180..=1800。
    pub timeout_reconnect_secs: u64,
    /// 超时清扫间隔（毫秒）。
    pub sweep_interval_ms: u64,
    /// 维护任务节拍（毫秒）。
    pub tick_ms: u64,
    /// 连接写空闲心跳间隔（毫秒）。
    pub heartbeat_ms: u64,
    /// 匹配的请求强制携带日志标志。
    pub force_log: Vec<LogRule>,
    #[serde(rename = "route")]
    pub routes: Vec<RouteConfig>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            timeout_connect_secs: 5,
            timeout_request_secs: 10,
            timeout_reconnect_secs: 600,
            sweep_interval_ms: 1_000,
            tick_ms: 30,
            heartbeat_ms: 3_000,
            force_log: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl ConsumerConfig {
    pub fn normalized(mut self) -> Self {
        self.timeout_connect_secs = clamp_range("timeout_connect_secs", self.timeout_connect_secs, 1, 60);
        self.timeout_reconnect_secs =
            clamp_range("timeout_reconnect_secs", self.timeout_reconnect_secs, 180, 1_800);
        self.sweep_interval_ms = clamp_range("sweep_interval_ms", self.sweep_interval_ms, 100, 60_000);
        self.tick_ms = clamp_range("tick_ms", self.tick_ms, 10, 1_000);
        self.heartbeat_ms = clamp_range("heartbeat_ms", self.heartbeat_ms, 500, 60_000);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_connect_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.timeout_request_secs > 0).then(|| Duration::from_secs(self.timeout_request_secs))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.timeout_reconnect_secs)
    }

    /// 解析本地路由表。
    pub fn local_routes(&self) -> Result<Vec<LocalRoute>, UbsiError> {
        self.routes.iter().map(RouteConfig::to_route).collect()
    }

    pub(crate) fn forces_log(&self, service: &str, entry: &str) -> bool {
        self.force_log.iter().any(|rule| {
            match_pattern(rule.service.as_deref(), service)
                && match_pattern(rule.entry.as_deref(), entry)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogRule {
    pub service: Option<String>,
    pub entry: Option<String>,
}

/// `[[route]]` 表项。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub service: Option<String>,
    pub entry: Option<String>,
    /// `a.b.c` 形式的最低版本。
    pub version_min: Option<String>,
    pub version_max: Option<String>,
    pub release: Option<bool>,
    pub mock: bool,
    /// 缺省时回落到注册表；空列表表示显式无可用节点。
    pub nodes: Option<Vec<NodeConfig>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NodeConfig {
    Addr(String),
    Weighted { addr: String, weight: f64 },
}

impl RouteConfig {
    pub fn to_route(&self) -> Result<LocalRoute, UbsiError> {
        let version = VersionRange {
            min: parse_version_opt(self.version_min.as_deref())?,
            max: parse_version_opt(self.version_max.as_deref())?,
            release: self.release,
        };
        let nodes = match &self.nodes {
            None => None,
            Some(nodes) => Some(
                nodes
                    .iter()
                    .map(NodeConfig::to_node)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        Ok(LocalRoute {
            service: self.service.clone(),
            entry: self.entry.clone(),
            version,
            mock: self.mock,
            nodes,
        })
    }
}

impl NodeConfig {
    fn to_node(&self) -> Result<RouteNode, UbsiError> {
        let (addr, weight) = match self {
            NodeConfig::Addr(addr) => (addr, 1.0),
            NodeConfig::Weighted { addr, weight } => (addr, *weight),
        };
        let (host, port) = parse_container_name(addr)
            .ok_or_else(|| UbsiError::config(format!("route node `{addr}` is not host#port")))?;
        Ok(RouteNode::new(host, port, weight))
    }
}

fn parse_version_opt(text: Option<&str>) -> Result<u32, UbsiError> {
    match text {
        None => Ok(0),
        Some(text) => parse_version(text)
            .ok_or_else(|| UbsiError::config(format!("invalid version `{text}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubsi_core::config::from_toml_str;

    #[test]
    fn route_table_from_toml() {
        let config: ConsumerConfig = from_toml_str(
            r##"
            timeout_reconnect_secs = 5

            [[force_log]]
            service = "order*"

            [[route]]
            service = "echo"
            version_min = "1.2"
            nodes = ["127.0.0.1#7112", { addr = "127.0.0.1#7113", weight = 2.0 }]

            [[route]]
            service = "pay*"
            mock = true
            "##,
        )
        .unwrap();
        let config = config.normalized();
        assert_eq!(config.timeout_reconnect_secs, 180);
        assert!(config.forces_log("orders", "list"));
        assert!(!config.forces_log("echo", "echo"));

        let routes = config.local_routes().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].version.min, 1_002_000);
        let nodes = routes[0].nodes.as_ref().unwrap();
        assert_eq!(nodes[1].port, 7113);
        assert_eq!(nodes[1].weight, 2.0);
        assert!(routes[1].mock && routes[1].nodes.is_none());
    }

    #[test]
    fn bad_node_address_is_config_error() {
        let route = RouteConfig {
            nodes: Some(vec![NodeConfig::Addr("nohash".into())]),
            ..Default::default()
        };
        assert!(matches!(route.to_route(), Err(UbsiError::Config { .. })));
    }
}
