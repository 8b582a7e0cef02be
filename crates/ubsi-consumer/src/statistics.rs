//! 按服务/接口聚合的调用统计。

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use ubsi_core::ResultCode;

#[derive(Debug, Default)]
struct EntryCounters {
    request: AtomicU64,
    result: AtomicU64,
    success: AtomicU64,
    max_time_ms: AtomicU64,
    max_req_id: Mutex<String>,
}

/// 某个服务/接口的统计快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatistics {
    pub service: String,
    pub entry: String,
    /// 发出的请求数。
    pub request: u64,
    /// 得到结果（含失败）的请求数。
    pub result: u64,
    /// 成功结果数。
    pub success: u64,
    /// 最长耗时（毫秒）。
    pub max_time_ms: u64,
    /// 最长耗时对应的请求 ID。
    pub max_req_id: String,
}

/// 调用统计表。计数器均为无锁原子量，仅“最慢请求 ID”在刷新峰值时短暂加锁。
#[derive(Debug, Default)]
pub struct Statistics {
    entries: DashMap<(String, String), Arc<EntryCounters>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, service: &str, entry: &str) -> Arc<EntryCounters> {
        let key = (service.to_owned(), entry.to_owned());
        if let Some(found) = self.entries.get(&key) {
            return Arc::clone(found.value());
        }
        Arc::clone(self.entries.entry(key).or_default().value())
    }

    pub(crate) fn record_request(&self, service: &str, entry: &str) {
        self.counters(service, entry)
            .request
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result(
        &self,
        service: &str,
        entry: &str,
        req_id: &str,
        code: ResultCode,
        elapsed: Duration,
    ) {
        let counters = self.counters(service, entry);
        counters.result.fetch_add(1, Ordering::Relaxed);
        if code.is_ok() {
            counters.success.fetch_add(1, Ordering::Relaxed);
        }
        let ms = elapsed.as_millis() as u64;
        if counters.max_time_ms.fetch_max(ms, Ordering::AcqRel) < ms {
            *counters.max_req_id.lock() = req_id.to_owned();
        }
    }

    /// 读取单个服务/接口的快照。
    pub fn get(&self, service: &str, entry: &str) -> Option<EntryStatistics> {
        let key = (service.to_owned(), entry.to_owned());
        self.entries
            .get(&key)
            .map(|found| snapshot(&key, found.value()))
    }

    /// 读取全部快照，按服务/接口排序。
    pub fn snapshot(&self) -> Vec<EntryStatistics> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|item| snapshot(item.key(), item.value()))
            .collect();
        all.sort_by(|a, b| (&a.service, &a.entry).cmp(&(&b.service, &b.entry)));
        all
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn snapshot(key: &(String, String), counters: &EntryCounters) -> EntryStatistics {
    EntryStatistics {
        service: key.0.clone(),
        entry: key.1.clone(),
        request: counters.request.load(Ordering::Relaxed),
        result: counters.result.load(Ordering::Relaxed),
        success: counters.success.load(Ordering::Relaxed),
        max_time_ms: counters.max_time_ms.load(Ordering::Relaxed),
        max_req_id: counters.max_req_id.lock().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_slowest_request() {
        let stats = Statistics::new();
        stats.record_request("svc", "a");
        stats.record_request("svc", "a");
        stats.record_result("svc", "a", "r1", ResultCode::OK, Duration::from_millis(5));
        stats.record_result("svc", "a", "r2", ResultCode::TIMEOUT, Duration::from_millis(50));
        stats.record_result("svc", "a", "r3", ResultCode::OK, Duration::from_millis(10));

        let snap = stats.get("svc", "a").expect("recorded");
        assert_eq!(snap.request, 2);
        assert_eq!(snap.result, 3);
        assert_eq!(snap.success, 2);
        assert_eq!(snap.max_time_ms, 50);
        assert_eq!(snap.max_req_id, "r2");
        assert!(stats.get("svc", "b").is_none());
        assert_eq!(stats.snapshot().len(), 1);
    }
}
