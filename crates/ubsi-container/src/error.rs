use thiserror::Error;
use ubsi_core::UbsiError;
use ubsi_transport_tcp::TransportError;

/// 容器启动、模块生命周期与应答写出中的错误。
///
/// 请求处理路径上的失败不走此类型，而是转换为应答结果码。
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: TransportError,
    },
    #[error("container already started")]
    AlreadyStarted,
    #[error("container not started")]
    NotStarted,
    #[error("service `{0}` is not installed")]
    NoService(String),
    #[error("service name `{0}` is reserved by the container")]
    Reserved(String),
    #[error("filter `{0}` is not installed")]
    NoFilter(String),
    #[error("module `{name}` cannot be loaded: {reason}")]
    Load { name: String, reason: String },
    #[error("service `{name}` cannot {action} in status {status}")]
    Transition {
        name: String,
        action: &'static str,
        status: i32,
    },
    #[error("hook of service `{name}` failed: {message}")]
    Hook { name: String, message: String },
    #[error("reply failed: {0}")]
    Reply(#[from] TransportError),
    #[error(transparent)]
    Ubsi(#[from] UbsiError),
}
