use crate::code::ResultCode;
use crate::codec::{DecodeError, EncodeError};
use thiserror::Error;

/// 携带结果码与文案的类型化调用错误。
///
/// # 教案式说明
/// - **意图（Why）**：同步调用路径需要把服务端或本地的失败结果“抛给”调用方，
///   同时保留数值结果码，便于按码分支；
/// - **契约（What）**：`code` 永不为 [`ResultCode::OK`]；`message` 为人类可读描述。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct ResultError {
    pub code: ResultCode,
    pub message: String,
}

impl ResultError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// 框架级聚合错误。
#[derive(Debug, Error)]
pub enum UbsiError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Result(#[from] ResultError),
    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {message}")]
    Config { message: String },
    #[error("backing store failed: {message}")]
    Store { message: String },
}

impl UbsiError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// 映射到最贴近的结果码，供跨边界上报使用。
    pub fn code(&self) -> ResultCode {
        match self {
            UbsiError::Result(err) => err.code,
            UbsiError::Decode(_) | UbsiError::Encode(_) => ResultCode::CHANNEL,
            UbsiError::Io(_) => ResultCode::CONNECT,
            UbsiError::Config { .. } => ResultCode::REQUEST,
            UbsiError::Store { .. } => ResultCode::MESSAGE,
        }
    }
}
