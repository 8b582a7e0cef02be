//! 容器端配置。
//!
//! ```toml
//! host = "10.0.0.5"
//! port = 7112
//! overload = 200
//! work_threads = 32
//! forward_secs = 60
//! fuse = 4
//! accept_hosts = ["10.0.0.0", "127.0.0.1"]
//! forward_doors = ["legacy-order"]
//!
//! [[acl]]
//! service = "order*"
//! default = 1
//! hosts = { "10.0.0.8" = 3 }
//!
//! [consumer]
//! timeout_request_secs = 30
//! ```

use crate::acl::{AccessControl, AclRule};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use ubsi_consumer::ConsumerConfig;
use ubsi_core::config::clamp_range;

/// 读权限位。
pub const ACL_READ: u8 = 0x01;
/// 写权限位。
pub const ACL_WRITE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// 监听并对外公布的主机地址。
    pub host: String,
    /// 监听端口；0 表示由系统分配。
    pub port: u16,
    pub backlog: u32,
    /// 等待中请求数达到此值时拒绝新请求，范围 10..=10000。
    pub overload: u32,
    /// 工作线程数，范围 8..=256。
    pub work_threads: u32,
    /// 转发超时（秒），0 关闭转发。
    pub forward_secs: u64,
    /// 熔断阈值，0 关闭熔断；上限为工作线程数的一半。
    pub fuse: u32,
    /// 网关容器标记，随注册记录公布。
    pub gateway: bool,
    /// 允许建连的对端地址；为空时不限制。
    pub accept_hosts: Vec<String>,
    /// 只转发不托管的服务名，随注册记录公布。
    pub forward_doors: Vec<String>,
    /// 未命中任何 ACL 规则时的权限。
    pub acl_default: u8,
    pub acl: Vec<AclConfig>,
    /// 全量注册记录的刷新间隔（毫秒）。
    pub register_interval_ms: u64,
    /// 等待数心跳的发送间隔（毫秒）。
    pub heartbeat_ms: u64,
    /// 连接读空闲上限（毫秒）。
    pub reader_idle_ms: u64,
    /// 单例启动锁释放后的残留时长（毫秒）。
    pub singleton_linger_ms: u64,
    /// 转发请求与跨容器查询所用的内嵌调用端。
    pub consumer: ConsumerConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 7112,
            backlog: 128,
            overload: 100,
            work_threads: 20,
            forward_secs: 60,
            fuse: 0,
            gateway: false,
            accept_hosts: Vec::new(),
            forward_doors: Vec::new(),
            acl_default: ACL_READ | ACL_WRITE,
            acl: Vec::new(),
            register_interval_ms: 30_000,
            heartbeat_ms: 3_000,
            reader_idle_ms: 10_000,
            singleton_linger_ms: 10_000,
            consumer: ConsumerConfig::default(),
        }
    }
}

impl ContainerConfig {
    pub fn normalized(mut self) -> Self {
        self.overload = clamp_range("overload", self.overload, 10, 10_000);
        self.work_threads = clamp_range("work_threads", self.work_threads, 8, 256);
        self.forward_secs = clamp_range("forward_secs", self.forward_secs, 0, 600);
        self.fuse = clamp_range("fuse", self.fuse, 0, self.work_threads.div_ceil(2));
        self.backlog = clamp_range("backlog", self.backlog, 1, 65_535);
        self.register_interval_ms =
            clamp_range("register_interval_ms", self.register_interval_ms, 1_000, 600_000);
        self.heartbeat_ms = clamp_range("heartbeat_ms", self.heartbeat_ms, 100, 60_000);
        self.reader_idle_ms = clamp_range("reader_idle_ms", self.reader_idle_ms, 1_000, 600_000);
        self.acl_default &= ACL_READ | ACL_WRITE;
        self.consumer = self.consumer.normalized();
        self
    }

    /// 转发超时；`None` 表示关闭转发。
    pub fn forward_timeout(&self) -> Option<Duration> {
        (self.forward_secs > 0).then(|| Duration::from_secs(self.forward_secs))
    }

    pub fn access_control(&self) -> AccessControl {
        AccessControl::new(
            self.accept_hosts.clone(),
            self.acl_default,
            self.acl.iter().map(AclConfig::to_rule).collect(),
        )
    }
}

/// `[[acl]]` 表项。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// 服务名模式，支持尾部 `*`。
    pub service: String,
    pub default: u8,
    /// 对端地址到权限位的映射。
    pub hosts: BTreeMap<String, u8>,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            service: "*".to_owned(),
            default: ACL_READ | ACL_WRITE,
            hosts: BTreeMap::new(),
        }
    }
}

impl AclConfig {
    fn to_rule(&self) -> AclRule {
        AclRule {
            service: self.service.clone(),
            default: self.default,
            hosts: self.hosts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubsi_core::config::from_toml_str;

    #[test]
    fn ranges_are_clamped() {
        let config: ContainerConfig = from_toml_str(
            r#"
            overload = 5
            work_threads = 1000
            forward_secs = 9000
            fuse = 500
            "#,
        )
        .unwrap();
        let config = config.normalized();
        assert_eq!(config.overload, 10);
        assert_eq!(config.work_threads, 256);
        assert_eq!(config.forward_secs, 600);
        assert_eq!(config.fuse, 128);
    }

    #[test]
    fn forward_can_be_disabled() {
        let config = ContainerConfig {
            forward_secs: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.forward_timeout(), None);
        assert_eq!(
            ContainerConfig::default().forward_timeout(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn acl_table_and_nested_consumer() {
        let config: ContainerConfig = from_toml_str(
            r#"
            port = 9000
            accept_hosts = ["127.0.0.1"]

            [[acl]]
            service = "order*"
            default = 1
            hosts = { "10.0.0.8" = 3 }

            [consumer]
            timeout_request_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.acl.len(), 1);
        assert_eq!(config.acl[0].hosts["10.0.0.8"], 3);
        assert_eq!(config.consumer.timeout_request_secs, 30);
        assert_eq!(config.consumer.timeout_connect_secs, 5);
    }
}
