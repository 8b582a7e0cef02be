//! 在途调用表与熔断判定。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 服务端不会强行中止已超时的调用；当同一接口已有多个调用卡在超时之后，
//!   继续放入新调用只会占满工作线程，此时应快速失败。
//!
//! ## 逻辑 (How)
//! - 流水线的每一步（过滤器 `before`、服务接口、过滤器 `after`）以请求 ID 为键登记
//!   “当前步骤 + 开始时刻 + 步骤超时”，后一步覆盖前一步，请求结束时移除；
//! - 判定时统计同一 `service/entry` 上已超过自身超时的在途调用数，达到阈值即熔断。
//!
//! ## 注意事项 (Trade-offs)
//! - 判定需要遍历在途表，规模受工作线程数约束，不维护额外的按接口索引。

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// 一个在途步骤的只读视图。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DealingView {
    pub(crate) request_id: String,
    pub(crate) service: String,
    pub(crate) entry: String,
    pub(crate) elapsed: Duration,
    pub(crate) timeout: Duration,
}

#[derive(Debug, Clone)]
struct Dealing {
    service: String,
    entry: String,
    started: Instant,
    timeout: Duration,
}

impl Dealing {
    fn overdue(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) > self.timeout
    }
}

#[derive(Debug, Default)]
pub(crate) struct DealingTable {
    calls: DashMap<String, Dealing>,
}

impl DealingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 登记或覆盖请求的当前步骤。
    pub(crate) fn enter(&self, request_id: &str, service: &str, entry: &str, timeout: Duration) {
        self.calls.insert(
            request_id.to_owned(),
            Dealing {
                service: service.to_owned(),
                entry: entry.to_owned(),
                started: Instant::now(),
                timeout,
            },
        );
    }

    pub(crate) fn leave(&self, request_id: &str) {
        self.calls.remove(request_id);
    }

    /// 同一步骤上已超时的在途调用数。
    pub(crate) fn overdue(&self, service: &str, entry: &str, now: Instant) -> usize {
        self.calls
            .iter()
            .filter(|call| call.service == service && call.entry == entry && call.overdue(now))
            .count()
    }

    /// 服务（或过滤器）是否存在已超时的在途调用。
    pub(crate) fn has_overdue(&self, service: &str, now: Instant) -> bool {
        self.calls
            .iter()
            .any(|call| call.service == service && call.overdue(now))
    }

    /// 服务（或过滤器）是否有在途步骤。
    pub(crate) fn busy(&self, service: &str) -> bool {
        self.calls.iter().any(|call| call.service == service)
    }

    /// 在途步骤列表，按开始时刻排序；`service` 为 `None` 时不过滤。
    pub(crate) fn snapshot(&self, service: Option<&str>, now: Instant) -> Vec<DealingView> {
        let mut views: Vec<_> = self
            .calls
            .iter()
            .filter(|call| service.is_none_or(|name| call.service == name))
            .map(|call| {
                (
                    call.started,
                    DealingView {
                        request_id: call.key().clone(),
                        service: call.service.clone(),
                        entry: call.entry.clone(),
                        elapsed: now.saturating_duration_since(call.started),
                        timeout: call.timeout,
                    },
                )
            })
            .collect();
        views.sort_by_key(|(started, _)| *started);
        views.into_iter().map(|(_, view)| view).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

/// 熔断阈值为 0 时关闭。
pub(crate) fn tripped(fuse: u32, overdue: usize) -> bool {
    fuse > 0 && overdue >= fuse as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_overdue_calls_of_the_same_entry_count() {
        let table = DealingTable::new();
        table.enter("r1", "svc", "slow", Duration::ZERO);
        table.enter("r2", "svc", "slow", Duration::ZERO);
        table.enter("r3", "svc", "slow", Duration::from_secs(60));
        table.enter("r4", "svc", "fast", Duration::ZERO);
        let later = Instant::now() + Duration::from_millis(5);

        assert_eq!(table.overdue("svc", "slow", later), 2);
        assert!(tripped(2, table.overdue("svc", "slow", later)));
        assert!(!tripped(3, table.overdue("svc", "slow", later)));
        assert!(!tripped(0, 100));

        table.leave("r1");
        assert_eq!(table.overdue("svc", "slow", later), 1);
        assert!(table.has_overdue("svc", later));
        assert!(!table.has_overdue("other", later));
    }

    #[test]
    fn snapshot_filters_by_service() {
        let table = DealingTable::new();
        table.enter("r1", "svc", "slow", Duration::from_secs(1));
        table.enter("r2", "other", "x", Duration::from_secs(1));
        let later = Instant::now() + Duration::from_millis(5);

        assert_eq!(table.snapshot(None, later).len(), 2);
        let only = table.snapshot(Some("svc"), later);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].request_id, "r1");
        assert!(only[0].elapsed >= Duration::from_millis(5));
        assert!(table.busy("other"));
        assert!(!table.busy("idle"));
    }

    #[test]
    fn later_step_replaces_earlier_one() {
        let table = DealingTable::new();
        table.enter("r1", "audit-filter", "", Duration::ZERO);
        table.enter("r1", "svc", "slow", Duration::from_secs(60));
        let later = Instant::now() + Duration::from_millis(5);
        assert_eq!(table.len(), 1);
        assert!(!table.has_overdue("audit-filter", later));
    }
}
