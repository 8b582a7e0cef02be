//! 后端存储契约与进程内实现。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 服务发现、心跳广播、单例锁与消息投递都建立在一个外部键值/发布订阅存储之上；
//!   框架只依赖其最小能力集，具体存储（如 Redis）由宿主以 [`Store`] 适配。
//! - [`MemoryStore`] 提供同进程内的完整语义，供单机部署与测试使用。
//!
//! ## 契约 (What)
//! - `get`/`set`：普通键读写，`set` 可附带过期时间；
//! - `set_nx`：键不存在时写入并设置过期，返回是否写入成功；
//! - `expire`：调整已有键的过期时间；
//! - `hget`/`hset`/`hdel`/`hgetall`：哈希字段读写；
//! - `publish`/`subscribe`：按通道广播 [`StoreMessage`]，订阅在 [`Subscription`] 被丢弃后自动注销。
//!
//! ## 注意事项 (Trade-offs)
//! - `MemoryStore` 采用惰性过期：读取时才清理过期键，不启动后台任务。

use crate::error::UbsiError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// 通知通道上的一条消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMessage {
    /// 心跳/变更/关闭文本。
    Text(String),
    /// 编码后的应答元组（消息投递模式）。
    Binary(Bytes),
}

/// 一个通道订阅。
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<StoreMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<StoreMessage>) -> Self {
        Self { rx }
    }

    /// 等待下一条消息；存储关闭时返回 `None`。
    pub async fn recv(&mut self) -> Option<StoreMessage> {
        self.rx.recv().await
    }
}

/// 后端存储的最小能力集。
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, UbsiError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), UbsiError>;

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, UbsiError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, UbsiError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, UbsiError>;

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), UbsiError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, UbsiError>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, UbsiError>;

    async fn publish(&self, channel: &str, message: StoreMessage) -> Result<(), UbsiError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, UbsiError>;
}

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    keys: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, Bytes>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<StoreMessage>>>,
}

impl MemoryState {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.keys.get(key).is_some_and(|e| e.expired(now)) {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }
}

/// 进程内存储。克隆共享同一份数据。
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 `Arc<dyn Store>` 形式返回，便于直接注入运行时。
    pub fn shared() -> Arc<dyn Store> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, UbsiError> {
        let mut state = self.state.lock();
        Ok(state.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), UbsiError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state
            .lock()
            .keys
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, UbsiError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, UbsiError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, UbsiError> {
        let state = self.state.lock();
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), UbsiError> {
        self.state
            .lock()
            .hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, UbsiError> {
        let mut state = self.state.lock();
        Ok(state
            .hashes
            .get_mut(key)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, UbsiError> {
        let state = self.state.lock();
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: StoreMessage) -> Result<(), UbsiError> {
        let mut state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, UbsiError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_existing_key_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(30);
        assert!(store.set_nx("lock", Bytes::from_static(b"a"), ttl).await.unwrap());
        assert!(!store.set_nx("lock", Bytes::from_static(b"b"), ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.set_nx("lock", Bytes::from_static(b"b"), ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn expire_shortens_lifetime() {
        let store = MemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store.expire("k", Duration::ZERO).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.expire("missing", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn hash_fields() {
        let store = MemoryStore::new();
        store.hset("h", "a", Bytes::from_static(b"1")).await.unwrap();
        store.hset("h", "b", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all, vec![("b".to_owned(), Bytes::from_static(b"2"))]);
    }

    #[tokio::test]
    async fn publish_reaches_every_live_subscriber() {
        let store = MemoryStore::new();
        let mut a = store.subscribe("ch").await.unwrap();
        let b = store.subscribe("ch").await.unwrap();
        drop(b);
        store
            .publish("ch", StoreMessage::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(a.recv().await, Some(StoreMessage::Text("hello".into())));
        assert_eq!(store.state.lock().subscribers["ch"].len(), 1);
    }
}
