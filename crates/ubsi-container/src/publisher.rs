//! 注册记录与心跳发布任务。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 调用端的路由快照完全来自后端存储：容器需要周期性写出完整记录，
//!   并以轻量心跳广播存活与负载，状态变化时通知对方全量重载。
//!
//! ## 逻辑 (How)
//! 1. 每个心跳节拍先重试等待中的单例服务；
//! 2. 收到刷新请求或单例状态变化时：写出完整记录并发布 `name|+`；
//! 3. 距上次完整写出超过注册间隔时：仅刷新记录；
//! 4. 其余节拍发布 `name` 或 `name|N`（N 为等待数）；
//! 5. 停止时删除记录并发布 `name|-`。
//!
//! ## 契约 (What)
//! - 没有后端存储时所有写出静默跳过，单例重试照常进行；
//! - 写出失败只记录日志，下一个节拍重试。

use crate::container::ContainerInner;
use crate::singleton;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use ubsi_core::registry::{
    NOTIFY_CHANNEL, REGISTRY_KEY, STATUS_RUNNING, ServiceRecord,
};
use ubsi_core::{ContainerRecord, Heartbeat, HeartbeatSignal, StoreMessage, UbsiError};

pub(crate) async fn run(inner: Arc<ContainerInner>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(inner.config.heartbeat_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let register_interval = Duration::from_millis(inner.config.register_interval_ms);
    let mut shutdown = inner.shutdown.subscribe();
    let mut last_full = Instant::now();

    loop {
        let flushed = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = inner.flush.notified() => true,
            _ = ticker.tick() => false,
        };
        let changed = singleton::retry_waiting(&inner).await;
        let name = inner.name();
        let outcome = if flushed || changed {
            last_full = Instant::now();
            write_record(&inner, &name, true).await
        } else if last_full.elapsed() >= register_interval {
            last_full = Instant::now();
            write_record(&inner, &name, false).await
        } else {
            let waiting = u32::try_from(inner.stats.waiting()).unwrap_or(u32::MAX);
            publish(&inner, Heartbeat::waiting(name.as_str(), waiting)).await
        };
        if let Err(err) = outcome {
            tracing::warn!(container = %name, error = %err, "registry publish failed");
        }
    }
    tracing::debug!(container = %inner.name(), "publisher stopped");
}

/// 当前容器的完整注册记录。
pub(crate) fn build_record(inner: &ContainerInner) -> ContainerRecord {
    let now = Instant::now();
    let counters = inner.stats.counters();
    let mut record = ContainerRecord {
        gateway: inner.config.gateway,
        overload: inner.config.overload,
        waiting: u32::try_from(counters.waiting()).unwrap_or(u32::MAX),
        deal: counters.deal,
        timestamp: inner.clock.now_millis(),
        ..ContainerRecord::default()
    };
    for entry in inner.services.iter() {
        let overdue = inner.dealing.has_overdue(entry.key(), now);
        record
            .services
            .insert(entry.key().clone(), entry.value().record(overdue));
    }
    for door in &inner.config.forward_doors {
        record
            .services
            .entry(door.clone())
            .or_insert_with(|| ServiceRecord {
                status: STATUS_RUNNING,
                ..ServiceRecord::default()
            });
    }
    record.filters = inner
        .filters
        .read()
        .iter()
        .map(|f| f.record(inner.dealing.has_overdue(&f.descriptor().class_name, now)))
        .collect();
    record
}

async fn write_record(inner: &ContainerInner, name: &str, notify: bool) -> Result<(), UbsiError> {
    let Some(store) = &inner.store else {
        return Ok(());
    };
    let bytes = build_record(inner).encode()?;
    store.hset(REGISTRY_KEY, name, bytes).await?;
    if notify {
        publish(inner, Heartbeat::new(name, HeartbeatSignal::Changed)).await?;
    }
    Ok(())
}

async fn publish(inner: &ContainerInner, heartbeat: Heartbeat) -> Result<(), UbsiError> {
    match &inner.store {
        Some(store) => {
            store
                .publish(NOTIFY_CHANNEL, StoreMessage::Text(heartbeat.to_string()))
                .await
        }
        None => Ok(()),
    }
}

/// 删除注册记录并广播关闭。
pub(crate) async fn deregister(inner: &ContainerInner) {
    let Some(store) = &inner.store else {
        return;
    };
    let name = inner.name();
    if let Err(err) = store.hdel(REGISTRY_KEY, &name).await {
        tracing::warn!(container = %name, error = %err, "registry record removal failed");
    }
    if let Err(err) = publish(inner, Heartbeat::new(name.as_str(), HeartbeatSignal::Closed)).await
    {
        tracing::warn!(container = %name, error = %err, "close notice failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::container::Container;
    use crate::filter::FilterDescriptor;
    use crate::module::{ServiceDescriptor, StaticModuleLoader};
    use crate::testing::{EchoService, NoopFilter};

    #[tokio::test]
    async fn record_lists_services_doors_and_filters() {
        let config = ContainerConfig {
            forward_doors: vec!["remote.billing".to_owned(), "echo".to_owned()],
            gateway: true,
            ..ContainerConfig::default()
        };
        let container =
            Container::new(config, Arc::new(StaticModuleLoader::new()), None).unwrap();
        container
            .install_descriptor(
                ServiceDescriptor::new("echo", || Box::new(EchoService)).class_name("demo.Echo"),
            )
            .unwrap();
        container.add_filter(FilterDescriptor::new("audit", || Box::new(NoopFilter)));

        let record = build_record(container.inner());
        assert!(record.gateway);
        assert!(record.timestamp > 0);
        assert_eq!(record.services["echo"].class_name, "demo.Echo");
        assert_eq!(record.services["echo"].status, 0);
        assert_eq!(record.services[""].status, STATUS_RUNNING);
        let door = &record.services["remote.billing"];
        assert!(door.class_name.is_empty());
        assert_eq!(door.status, STATUS_RUNNING);
        assert_eq!(record.filters.len(), 1);
        assert_eq!(record.filters[0].class_name, "audit");
    }
}
