//! 单例服务协调。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 声明为单例的服务在整个集群内至多一个存活实例；两个容器同时启动同一单例时，
//!   注册表视图可能都还看不到对方，需要一把短期分布式锁裁决。
//!
//! ## 逻辑 (How)
//! 1. 查询注册表快照：除自身外，任何有效容器上该服务处于运行或暂停，即进入等待；
//! 2. 以“不存在才写入并过期”获取 `_ubsi_lock_ss_<service>`，失败进入等待；
//! 3. 获胜者执行初始化钩子，随后把锁的剩余有效期缩短为残留时长，
//!    残留期覆盖“记录写出到对方看到”之间的窗口；
//! 4. 等待中的服务由发布任务在每个节拍重试。
//!
//! ## 契约 (What)
//! - 返回启动后的状态：[`STATUS_RUNNING`] 或 [`STATUS_SINGLETON_WAITING`]；
//! - 初始化钩子失败时锁照常释放，错误返回给调用方。

use crate::container::ContainerInner;
use crate::error::ContainerError;
use crate::module::HostedService;
use std::sync::Arc;
use std::time::Duration;
use ubsi_core::registry::{
    SINGLETON_LOCK_PREFIX, STATUS_PAUSED, STATUS_RUNNING, STATUS_SINGLETON_WAITING, STATUS_STOPPED,
};

/// 启动锁的有效期。
const LOCK_TTL: Duration = Duration::from_secs(60);

pub(crate) async fn try_start(
    inner: &ContainerInner,
    service: &HostedService,
) -> Result<i32, ContainerError> {
    let name = service.name();
    if let Some(holder) = live_instance(inner, name) {
        tracing::debug!(service = %name, holder = %holder, "singleton alive elsewhere, waiting");
        return Ok(STATUS_SINGLETON_WAITING);
    }
    let key = format!("{SINGLETON_LOCK_PREFIX}{name}");
    if !inner.lock.try_acquire(&key, LOCK_TTL).await? {
        tracing::debug!(service = %name, "singleton start lock lost, waiting");
        return Ok(STATUS_SINGLETON_WAITING);
    }
    let init = service.run_init();
    let linger = Duration::from_millis(inner.config.singleton_linger_ms);
    if let Err(err) = inner.lock.release(&key, linger).await {
        tracing::warn!(service = %name, error = %err, "singleton start lock release failed");
    }
    init.map(|()| STATUS_RUNNING)
}

/// 他处存活实例所在的容器名。
fn live_instance(inner: &ContainerInner, service: &str) -> Option<String> {
    let me = inner.name();
    let router = inner.consumer.router();
    let now = router.clock().now_millis();
    let store_active = router.store_active();
    router
        .registry()
        .iter()
        .filter(|(name, record)| **name != me && !record.is_invalid(now, store_active))
        .find(|(_, record)| {
            record
                .services
                .get(service)
                .is_some_and(|s| s.status == STATUS_RUNNING || s.status == STATUS_PAUSED)
        })
        .map(|(name, _)| name.clone())
}

/// 重试所有等待中的单例，返回是否有服务状态发生变化。
pub(crate) async fn retry_waiting(inner: &ContainerInner) -> bool {
    let waiting: Vec<Arc<HostedService>> = inner
        .services
        .iter()
        .filter(|entry| entry.status() == STATUS_SINGLETON_WAITING)
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    let mut changed = false;
    for service in waiting {
        // 正在执行其他生命周期操作的服务留到下个节拍
        let Ok(_guard) = service.try_lock_lifecycle() else {
            continue;
        };
        if service.status() != STATUS_SINGLETON_WAITING {
            continue;
        }
        match try_start(inner, &service).await {
            Ok(STATUS_RUNNING) => {
                service.set_status(STATUS_RUNNING);
                changed = true;
                tracing::info!(service = %service.name(), "singleton promoted to running");
            }
            Ok(_) => {}
            Err(err) => {
                service.set_status(STATUS_STOPPED);
                changed = true;
                tracing::warn!(service = %service.name(), error = %err, "singleton start failed");
            }
        }
    }
    changed
}
