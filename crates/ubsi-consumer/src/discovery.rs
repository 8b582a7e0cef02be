//! 注册表同步：全量加载、心跳增量更新与失联清理。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 全量记录较大，不能每个心跳都重载；心跳只携带等待数，只有“记录已变更”才触发单条重载；
//! - 各容器与调用端的时钟并不同步，记录中的时间戳需要归一化到本地时钟再参与新鲜度判断。
//!
//! ## 逻辑 (How)
//! - 订阅任务只负责把文本心跳压入队列，真正的处理在维护任务的每个节拍内批量进行；
//! - 同一节拍内对同一容器的多次重载请求合并为一次 `hget`；
//! - 所有修改在快照的克隆上完成，节拍末尾整体安装，读者不会看到中间状态；
//! - 每个接收窗口结束时，窗口内未出现过的容器被移出快照并从存储中删除。
//!
//! ## 契约 (What)
//! - 全量加载：时间戳距今不足 10 个接收窗口的记录被归一化为“本地当前时间减一个发送间隔”；
//! - `name|N`/`name`：已知容器刷新时间戳与等待数，未知容器触发重载；
//! - `name|+`：重载；`name|-`：时间戳置 0，立即失效。

use crate::router::Router;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use ubsi_core::registry::{BEATHEART_RECV_MS, BEATHEART_SEND_MS, REGISTRY_KEY};
use ubsi_core::{ContainerRecord, Heartbeat, HeartbeatSignal, Store, UbsiError};

#[derive(Debug, Default)]
pub(crate) struct Discovery {
    queue: Mutex<Vec<String>>,
    active: Mutex<HashSet<String>>,
    last_purge_ms: AtomicI64,
}

impl Discovery {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, text: String) {
        self.queue.lock().push(text);
    }

    /// 全量加载注册表并安装快照，返回容器数。
    pub(crate) async fn load_all(&self, router: &Router, store: &dyn Store) -> Result<usize, UbsiError> {
        let now = router.clock().now_millis();
        let mut records = BTreeMap::new();
        for (name, bytes) in store.hgetall(REGISTRY_KEY).await? {
            match ContainerRecord::decode(&bytes) {
                Ok(mut record) => {
                    if now - record.timestamp < BEATHEART_RECV_MS * 10 {
                        record.timestamp = now - BEATHEART_SEND_MS;
                    }
                    records.insert(name, record);
                }
                Err(err) => {
                    tracing::warn!(container = %name, error = %err, "undecodable registry record skipped");
                }
            }
        }
        let count = records.len();
        router.install_registry(records);
        self.active.lock().clear();
        self.last_purge_ms.store(now, Ordering::Release);
        tracing::info!(containers = count, "registry loaded");
        Ok(count)
    }

    /// 处理本节拍积累的心跳。
    pub(crate) async fn process(&self, router: &Router, store: &dyn Store) -> Result<(), UbsiError> {
        let texts = std::mem::take(&mut *self.queue.lock());
        if texts.is_empty() {
            return Ok(());
        }
        let now = router.clock().now_millis();
        let mut records = (*router.registry()).clone();
        let mut reload = HashSet::new();
        let mut changed = false;

        for text in texts {
            let Some(beat) = Heartbeat::parse(&text) else {
                continue;
            };
            let name = beat.container;
            match beat.signal {
                HeartbeatSignal::Alive | HeartbeatSignal::Waiting(_) => {
                    self.active.lock().insert(name.clone());
                    let waiting = match beat.signal {
                        HeartbeatSignal::Waiting(n) => n,
                        _ => 0,
                    };
                    match records.get_mut(&name) {
                        Some(record) => {
                            record.timestamp = now;
                            record.waiting = waiting;
                            changed = true;
                        }
                        None => {
                            reload.insert(name);
                        }
                    }
                }
                HeartbeatSignal::Changed => {
                    self.active.lock().insert(name.clone());
                    reload.insert(name);
                }
                HeartbeatSignal::Closed => {
                    self.active.lock().remove(&name);
                    reload.remove(&name);
                    if let Some(record) = records.get_mut(&name) {
                        record.timestamp = 0;
                        changed = true;
                    }
                    tracing::info!(container = %name, "container closed");
                }
            }
        }

        for name in reload {
            match store.hget(REGISTRY_KEY, &name).await? {
                Some(bytes) => match ContainerRecord::decode(&bytes) {
                    Ok(mut record) => {
                        record.timestamp = now;
                        tracing::debug!(container = %name, services = record.services.len(), "registry record reloaded");
                        records.insert(name, record);
                        changed = true;
                    }
                    Err(err) => {
                        tracing::warn!(container = %name, error = %err, "undecodable registry record skipped");
                    }
                },
                None => {
                    tracing::debug!(container = %name, "heartbeat for unregistered container ignored");
                }
            }
        }

        if changed {
            router.install_registry(records);
        }
        Ok(())
    }

    /// 每个接收窗口执行一次：清理窗口内未出现过的容器。
    pub(crate) async fn purge_if_due(&self, router: &Router, store: &dyn Store) -> Result<usize, UbsiError> {
        let now = router.clock().now_millis();
        if now - self.last_purge_ms.load(Ordering::Acquire) < BEATHEART_RECV_MS {
            return Ok(0);
        }
        self.last_purge_ms.store(now, Ordering::Release);
        let active = std::mem::take(&mut *self.active.lock());
        let snapshot = router.registry();
        let silent: Vec<String> = snapshot
            .keys()
            .filter(|name| !active.contains(*name))
            .cloned()
            .collect();
        if silent.is_empty() {
            return Ok(0);
        }
        let mut records = (*snapshot).clone();
        for name in &silent {
            records.remove(name);
        }
        router.install_registry(records);
        for name in &silent {
            tracing::warn!(container = %name, "silent container purged");
            store.hdel(REGISTRY_KEY, name).await?;
        }
        Ok(silent.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRegistry;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;
    use ubsi_core::registry::{STATUS_RUNNING, ServiceRecord};
    use ubsi_core::{ManualClock, MemoryStore};

    const NOW: i64 = 1_700_000_000_000;

    fn record(timestamp: i64) -> ContainerRecord {
        let mut record = ContainerRecord {
            overload: 100,
            timestamp,
            ..Default::default()
        };
        record.services.insert(
            "svc".into(),
            ServiceRecord {
                status: STATUS_RUNNING,
                ..Default::default()
            },
        );
        record
    }

    async fn seeded() -> (Arc<ManualClock>, Router, MemoryStore, Discovery) {
        let clock = ManualClock::new(NOW);
        let router = Router::new(
            Arc::clone(&clock) as Arc<dyn ubsi_core::Clock>,
            Duration::from_secs(180),
            Arc::new(MockRegistry::new()),
        );
        let store = MemoryStore::new();
        // 远端时钟领先 20 秒，仍应被归一化
        store
            .hset(REGISTRY_KEY, "a#1", record(NOW + 20_000).encode().unwrap())
            .await
            .unwrap();
        store
            .hset(REGISTRY_KEY, "dead#1", record(NOW - 3_600_000).encode().unwrap())
            .await
            .unwrap();
        let discovery = Discovery::new();
        discovery.load_all(&router, &store).await.unwrap();
        (clock, router, store, discovery)
    }

    #[tokio::test]
    async fn load_normalizes_recent_timestamps() {
        let (_, router, _, _) = seeded().await;
        let registry = router.registry();
        assert_eq!(registry["a#1"].timestamp, NOW - BEATHEART_SEND_MS);
        assert_eq!(registry["dead#1"].timestamp, NOW - 3_600_000);
    }

    #[tokio::test]
    async fn heartbeats_update_reload_and_close() {
        let (clock, router, store, discovery) = seeded().await;
        store
            .hset(REGISTRY_KEY, "b#1", record(0).encode().unwrap())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));

        discovery.push("a#1|7".into());
        discovery.push("b#1".into());
        discovery.push("b#1|+".into());
        discovery.push("nobody#1|+".into());
        discovery.process(&router, &store).await.unwrap();

        let registry = router.registry();
        assert_eq!(registry["a#1"].waiting, 7);
        assert_eq!(registry["a#1"].timestamp, NOW + 1_000);
        assert_eq!(registry["b#1"].timestamp, NOW + 1_000);
        assert!(!registry.contains_key("nobody#1"));

        discovery.push("a#1|-".into());
        discovery.process(&router, &store).await.unwrap();
        assert_eq!(router.registry()["a#1"].timestamp, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn undecodable_records_are_skipped_on_load() {
        let (_, router, store, discovery) = seeded().await;
        store
            .hset(REGISTRY_KEY, "junk#1", bytes::Bytes::from_static(&[0xFF, 0x00]))
            .await
            .unwrap();
        assert_eq!(discovery.load_all(&router, &store).await.unwrap(), 2);
        assert!(!router.registry().contains_key("junk#1"));
        assert!(logs_contain("undecodable registry record skipped"));
    }

    #[tokio::test]
    #[traced_test]
    async fn silent_containers_are_purged_after_window() {
        let (clock, router, store, discovery) = seeded().await;
        clock.advance(Duration::from_secs(5));
        discovery.push("a#1".into());
        discovery.process(&router, &store).await.unwrap();
        assert_eq!(discovery.purge_if_due(&router, &store).await.unwrap(), 0);

        clock.advance(Duration::from_millis(BEATHEART_RECV_MS as u64));
        assert_eq!(discovery.purge_if_due(&router, &store).await.unwrap(), 1);
        let registry = router.registry();
        assert!(registry.contains_key("a#1"));
        assert!(!registry.contains_key("dead#1"));
        assert!(store.hget(REGISTRY_KEY, "dead#1").await.unwrap().is_none());
        assert!(logs_contain("silent container purged"));
    }
}
