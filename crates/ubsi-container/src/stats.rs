//! 容器计数器与按接口统计。

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 容器级计数器快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerCounters {
    pub sockets_connected: u64,
    pub sockets_closed: u64,
    /// 已受理（进入工作线程池）的请求数。
    pub total: u64,
    /// 因过载被拒绝的请求数。
    pub overload: u64,
    /// 已处理完成的请求数。
    pub deal: u64,
    /// 处理时长超过接口超时的请求数。
    pub over: u64,
    /// 被转发的请求数。
    pub forward: u64,
}

impl ContainerCounters {
    /// 等待中的请求数。
    pub fn waiting(&self) -> u64 {
        self.total.saturating_sub(self.deal)
    }
}

/// 一个接口的统计快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCounters {
    pub service: String,
    pub entry: String,
    pub deal: u64,
    pub errors: u64,
    pub max_time_ms: u64,
}

#[derive(Debug, Default)]
struct EntryCells {
    deal: AtomicU64,
    errors: AtomicU64,
    max_time_ms: AtomicU64,
}

#[derive(Debug, Default)]
pub struct ContainerStats {
    sockets_connected: AtomicU64,
    sockets_closed: AtomicU64,
    total: AtomicU64,
    overload: AtomicU64,
    deal: AtomicU64,
    over: AtomicU64,
    forward: AtomicU64,
    entries: DashMap<(String, String), Arc<EntryCells>>,
}

impl ContainerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn socket_connected(&self) {
        self.sockets_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn socket_closed(&self) {
        self.sockets_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn accepted(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn overloaded(&self) {
        self.overload.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn forwarded(&self) {
        self.forward.fetch_add(1, Ordering::Relaxed);
    }

    /// 请求处理完成。
    pub(crate) fn dealt(&self, over: bool) {
        if over {
            self.over.fetch_add(1, Ordering::Relaxed);
        }
        self.deal.fetch_add(1, Ordering::AcqRel);
    }

    /// 已受理但尚未完成的请求数。
    pub fn waiting(&self) -> u64 {
        let deal = self.deal.load(Ordering::Acquire);
        self.total.load(Ordering::Acquire).saturating_sub(deal)
    }

    pub(crate) fn record_entry(&self, service: &str, entry: &str, ok: bool, elapsed: Duration) {
        let cells = self
            .entries
            .entry((service.to_owned(), entry.to_owned()))
            .or_default()
            .clone();
        cells.deal.fetch_add(1, Ordering::Relaxed);
        if !ok {
            cells.errors.fetch_add(1, Ordering::Relaxed);
        }
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        cells.max_time_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn counters(&self) -> ContainerCounters {
        ContainerCounters {
            sockets_connected: self.sockets_connected.load(Ordering::Relaxed),
            sockets_closed: self.sockets_closed.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Acquire),
            overload: self.overload.load(Ordering::Relaxed),
            deal: self.deal.load(Ordering::Acquire),
            over: self.over.load(Ordering::Relaxed),
            forward: self.forward.load(Ordering::Relaxed),
        }
    }

    pub fn entry(&self, service: &str, entry: &str) -> Option<EntryCounters> {
        self.entries
            .get(&(service.to_owned(), entry.to_owned()))
            .map(|cells| snapshot(service, entry, &cells))
    }

    /// 全部接口统计，按服务名与接口名排序。
    pub fn entries(&self) -> Vec<EntryCounters> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|item| snapshot(&item.key().0, &item.key().1, item.value()))
            .collect();
        all.sort_by(|a, b| (&a.service, &a.entry).cmp(&(&b.service, &b.entry)));
        all
    }
}

fn snapshot(service: &str, entry: &str, cells: &EntryCells) -> EntryCounters {
    EntryCounters {
        service: service.to_owned(),
        entry: entry.to_owned(),
        deal: cells.deal.load(Ordering::Relaxed),
        errors: cells.errors.load(Ordering::Relaxed),
        max_time_ms: cells.max_time_ms.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_entry_maxima() {
        let stats = ContainerStats::new();
        stats.accepted();
        stats.accepted();
        stats.dealt(false);
        assert_eq!(stats.waiting(), 1);
        stats.dealt(true);
        stats.overloaded();

        stats.record_entry("svc", "a", true, Duration::from_millis(30));
        stats.record_entry("svc", "a", false, Duration::from_millis(10));
        stats.record_entry("svc", "b", true, Duration::from_millis(1));

        let counters = stats.counters();
        assert_eq!(counters.waiting(), 0);
        assert_eq!(counters.over, 1);
        assert_eq!(counters.overload, 1);
        let a = stats.entry("svc", "a").unwrap();
        assert_eq!((a.deal, a.errors, a.max_time_ms), (2, 1, 30));
        assert_eq!(stats.entries().len(), 2);
        assert_eq!(stats.entries()[1].entry, "b");
    }
}
