use std::io;
use thiserror::Error;
use ubsi_core::{DecodeError, EncodeError};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
    pub kind: TransportErrorKind,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "ubsi.transport.tcp.bind_failed",
    message: "tcp bind",
    kind: TransportErrorKind::Setup,
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "ubsi.transport.tcp.accept_failed",
    message: "tcp accept",
    kind: TransportErrorKind::Setup,
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "ubsi.transport.tcp.connect_failed",
    message: "tcp connect",
    kind: TransportErrorKind::Connect,
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "ubsi.transport.tcp.read_failed",
    message: "tcp read",
    kind: TransportErrorKind::Channel,
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "ubsi.transport.tcp.write_failed",
    message: "tcp write",
    kind: TransportErrorKind::Channel,
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "ubsi.transport.tcp.configure_failed",
    message: "tcp configure",
    kind: TransportErrorKind::Setup,
};

const TIMEOUT_CODE: &str = "ubsi.transport.tcp.timeout";
const CLOSED_CODE: &str = "ubsi.transport.tcp.closed";
const DECODE_CODE: &str = "ubsi.transport.tcp.decode_failed";
const ENCODE_CODE: &str = "ubsi.transport.tcp.encode_failed";

/// 错误大类，供上层决定映射到哪个结果码。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// 建连阶段失败（含超时）。
    Connect,
    /// 已建立的通道读写失败或被关闭。
    Channel,
    /// 对端数据不符合线协议。
    Protocol,
    /// 监听/配置失败。
    Setup,
}

/// 传输层错误：稳定错误码 + 文案 + 大类。
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    code: &'static str,
    message: String,
    kind: TransportErrorKind,
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

/// 将 IO 错误映射为传输错误。
pub(crate) fn map_io_error(op: OperationKind, error: io::Error) -> TransportError {
    TransportError {
        code: op.code,
        message: format!("{}: {}", op.message, error),
        kind: op.kind,
    }
}

/// 构造超时错误。
pub(crate) fn timeout_error(op: OperationKind) -> TransportError {
    TransportError {
        code: TIMEOUT_CODE,
        message: format!("{} timed out", op.message),
        kind: op.kind,
    }
}

/// 构造“通道已关闭”错误。
pub(crate) fn closed_error() -> TransportError {
    TransportError {
        code: CLOSED_CODE,
        message: "channel closed".to_owned(),
        kind: TransportErrorKind::Channel,
    }
}

/// 构造协议错误。
pub(crate) fn decode_error(error: DecodeError) -> TransportError {
    TransportError {
        code: DECODE_CODE,
        message: error.to_string(),
        kind: TransportErrorKind::Protocol,
    }
}

/// 构造编码错误。
pub(crate) fn encode_error(error: EncodeError) -> TransportError {
    TransportError {
        code: ENCODE_CODE,
        message: error.to_string(),
        kind: TransportErrorKind::Protocol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_code() {
        let err = map_io_error(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.code(), "ubsi.transport.tcp.connect_failed");
        assert_eq!(err.kind(), TransportErrorKind::Connect);
        assert!(err.message().starts_with("tcp connect"));

        let err = timeout_error(READ);
        assert_eq!(err.code(), TIMEOUT_CODE);
        assert_eq!(err.kind(), TransportErrorKind::Channel);
    }
}
