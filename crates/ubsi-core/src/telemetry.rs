//! 日志订阅器安装。
//!
//! # 教案级注释
//!
//! - **意图 (Why)**：调用端与容器端进程都以 `tracing` 输出结构化事件，需要一个统一入口安装
//!   格式化订阅器，并允许运维通过 `RUST_LOG` 调整级别。
//! - **逻辑 (How)**：`registry()` 叠加 `EnvFilter` 与 `fmt::layer()`；未设置 `RUST_LOG` 时默认 `info`。
//! - **契约 (What)**：进程内只能安装一次，重复安装返回 [`TelemetryError::AlreadyInstalled`]。

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

/// 安装订阅器时的错误。
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// 安装进程级格式化订阅器。
pub fn install_fmt_subscriber() -> Result<(), TelemetryError> {
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
