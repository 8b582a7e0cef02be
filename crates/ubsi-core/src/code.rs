//! 结果码。
//!
//! 服务端结果码为非负数，客户端本地产生的结果码为负数；应用自定义错误可使用
//! [`ResultCode::ERROR`] 及以上的任意值。线上以单字节（`i8`）承载。

use std::fmt;

/// 一次调用的结果码。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultCode(i8);

impl ResultCode {
    pub const OK: Self = Self(0);
    pub const OVERLOAD: Self = Self(1);
    pub const SHUTDOWN: Self = Self(2);
    pub const NOSERVICE: Self = Self(3);
    pub const NOENTRY: Self = Self(4);
    pub const STOP: Self = Self(5);
    pub const REJECT: Self = Self(6);
    pub const EXCEPTION: Self = Self(7);
    pub const FORWARD: Self = Self(8);
    pub const BREAK: Self = Self(9);
    pub const TRANSACTION: Self = Self(10);
    pub const PARAMS: Self = Self(11);
    pub const ERROR: Self = Self(100);

    pub const REQUEST: Self = Self(-1);
    pub const CONNECT: Self = Self(-2);
    pub const CHANNEL: Self = Self(-3);
    pub const TIMEOUT: Self = Self(-4);
    pub const ROUTER: Self = Self(-5);
    pub const MESSAGE: Self = Self(-6);
    pub const MOCK: Self = Self(-7);
    pub const FILTER: Self = Self(-8);
    pub const REPEAT: Self = Self(-9);

    pub const fn new(raw: i8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i8 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// 是否由客户端本地产生。
    pub const fn is_local(self) -> bool {
        self.0 < 0
    }

    /// 稳定的点分标签，用于日志与指标维度。
    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "ubsi.ok",
            1 => "ubsi.server.overload",
            2 => "ubsi.server.shutdown",
            3 => "ubsi.server.no_service",
            4 => "ubsi.server.no_entry",
            5 => "ubsi.server.stopped",
            6 => "ubsi.server.rejected",
            7 => "ubsi.server.exception",
            8 => "ubsi.server.forward_failed",
            9 => "ubsi.server.breaker_tripped",
            10 => "ubsi.server.transaction",
            11 => "ubsi.server.params",
            -1 => "ubsi.client.bad_request",
            -2 => "ubsi.client.connect_failed",
            -3 => "ubsi.client.channel_failed",
            -4 => "ubsi.client.timeout",
            -5 => "ubsi.client.no_route",
            -6 => "ubsi.client.message_unavailable",
            -7 => "ubsi.client.mock_invalid",
            -8 => "ubsi.client.filter_rejected",
            -9 => "ubsi.client.repeated",
            _ => "ubsi.application",
        }
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultCode({}, {})", self.0, self.label())
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i8> for ResultCode {
    fn from(raw: i8) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_codes_are_negative() {
        assert!(ResultCode::TIMEOUT.is_local());
        assert!(!ResultCode::OVERLOAD.is_local());
        assert!(ResultCode::OK.is_ok());
        assert_eq!(ResultCode::new(101).label(), "ubsi.application");
        assert_eq!(ResultCode::BREAK.label(), "ubsi.server.breaker_tripped");
    }
}
