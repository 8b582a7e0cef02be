//! 命名互斥：优先使用后端存储的“不存在才写入并过期”原语，无存储时退化为进程内锁。

use crate::error::UbsiError;
use crate::store::Store;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 带过期的命名锁。
///
/// # 教案式说明
/// - **意图（Why）**：单例启动等场景需要跨进程的短期互斥；持锁方崩溃时依赖过期自动释放。
/// - **契约（What）**：
///   - `try_acquire` 非阻塞，成功返回 `true`；
///   - `release` 不直接删除键，而是把剩余有效期缩短为 `linger`；
///   - 进程内退化模式下语义相同，仅作用于本进程。
pub struct NamedLock {
    store: Option<Arc<dyn Store>>,
    owner: String,
    local: Mutex<HashMap<String, Instant>>,
}

impl NamedLock {
    pub fn new(store: Option<Arc<dyn Store>>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
            local: Mutex::new(HashMap::new()),
        }
    }

    /// 尝试获取锁。
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, UbsiError> {
        match &self.store {
            Some(store) => {
                store
                    .set_nx(key, Bytes::from(self.owner.clone()), ttl)
                    .await
            }
            None => {
                let now = Instant::now();
                let mut local = self.local.lock();
                if local.get(key).is_some_and(|deadline| *deadline > now) {
                    return Ok(false);
                }
                local.insert(key.to_owned(), now + ttl);
                Ok(true)
            }
        }
    }

    /// 释放锁：把剩余有效期缩短为 `linger`。
    pub async fn release(&self, key: &str, linger: Duration) -> Result<(), UbsiError> {
        match &self.store {
            Some(store) => store.expire(key, linger).await.map(|_| ()),
            None => {
                let mut local = self.local.lock();
                if linger.is_zero() {
                    local.remove(key);
                } else if let Some(deadline) = local.get_mut(key) {
                    *deadline = Instant::now() + linger;
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLock")
            .field("owner", &self.owner)
            .field("store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn store_backed_lock_is_exclusive_across_owners() {
        let store = MemoryStore::shared();
        let a = NamedLock::new(Some(store.clone()), "a");
        let b = NamedLock::new(Some(store), "b");
        assert!(a.try_acquire("k", Duration::from_secs(60)).await.unwrap());
        assert!(!b.try_acquire("k", Duration::from_secs(60)).await.unwrap());
        a.release("k", Duration::ZERO).await.unwrap();
        assert!(b.try_acquire("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn local_fallback_behaves_the_same() {
        let lock = NamedLock::new(None, "solo");
        assert!(lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
        assert!(!lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
        lock.release("k", Duration::ZERO).await.unwrap();
        assert!(lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
    }
}
