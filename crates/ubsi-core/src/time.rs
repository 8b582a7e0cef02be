//! 可注入的墙钟。
//!
//! # 教案级注释
//!
//! - **意图 (Why)**：注册记录的时间戳、失败退避窗口与心跳新鲜度都以毫秒墙钟比较；
//!   直接读取系统时间会让退避与过期逻辑难以在测试中复现。
//! - **契约 (What)**：[`Clock::now_millis`] 返回 Unix 毫秒；[`ManualClock`] 仅在显式
//!   [`ManualClock::advance`] 时前进。
//! - **使用指引 (How)**：组件以 `Arc<dyn Clock>` 持有时钟，生产环境注入 [`SystemClock`]。

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 毫秒墙钟。
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// 系统墙钟。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// 手动推进的时钟，供测试驱动退避与过期逻辑。
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_ms),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 默认的共享系统时钟。
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_on_demand() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(SystemClock.now_millis() > 1_600_000_000_000);
    }
}
