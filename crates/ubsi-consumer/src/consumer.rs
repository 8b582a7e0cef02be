//! 调用端运行时对象与维护任务。

use crate::config::ConsumerConfig;
use crate::connector::Connector;
use crate::discovery::Discovery;
use crate::filter::{ConsumerFilter, FilterFactory};
use crate::mock::MockRegistry;
use crate::request::Request;
use crate::router::Router;
use crate::statistics::Statistics;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use ubsi_core::registry::NOTIFY_CHANNEL;
use ubsi_core::time::system_clock;
use ubsi_core::util::new_request_id;
use ubsi_core::{Clock, ResultCode, ResultError, Store, StoreMessage, Subscription, UbsiError, Value};

const STORE_RETRY_MIN: Duration = Duration::from_secs(1);
const STORE_RETRY_MAX: Duration = Duration::from_secs(60);

/// 调用端运行时。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把连接池、待决索引、路由快照、过滤器与统计收拢在一个显式的运行时对象中，
///   通过克隆句柄在任务之间共享，不依赖任何进程级全局状态。
///
/// ## 逻辑 (How)
/// - [`Consumer::start`] 启动唯一的维护任务：每个节拍处理心跳队列，
///   每个清扫间隔执行超时清扫，每个接收窗口清理失联容器，存储断开时按指数退避重连；
/// - 存储连接成功后先订阅通知通道再全量加载注册表，订阅任务把文本心跳压入队列，
///   二进制消息按请求 ID 完成消息投递模式的请求；
/// - 后台任务只持有弱引用，最后一个句柄被丢弃后自然退出。
///
/// ## 契约 (What)
/// - `request` 校验接口名非空并分配新的请求 ID；
/// - 未配置存储时仅使用本地路由表，消息投递模式不可用；
/// - **前置条件**：`start` 与各异步调用路径需在 Tokio 运行时内调用。
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    config: ConsumerConfig,
    router: Router,
    connector: Arc<Connector>,
    statistics: Arc<Statistics>,
    mocks: Arc<MockRegistry>,
    filters: RwLock<Vec<FilterFactory>>,
    store: Option<Arc<dyn Store>>,
    discovery: Discovery,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig, store: Option<Arc<dyn Store>>) -> Result<Self, UbsiError> {
        Self::with_clock(config, store, system_clock())
    }

    /// 以指定时钟构造，供测试驱动退避与过期逻辑。
    pub fn with_clock(
        config: ConsumerConfig,
        store: Option<Arc<dyn Store>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, UbsiError> {
        let config = config.normalized();
        let routes = config.local_routes()?;
        let mocks = Arc::new(MockRegistry::new());
        let router = Router::new(clock, config.reconnect_backoff(), Arc::clone(&mocks));
        router.set_local_routes(routes);
        let connector = Arc::new(Connector::new(
            config.connect_timeout(),
            Duration::from_millis(config.heartbeat_ms),
        ));
        Ok(Self {
            inner: Arc::new(ConsumerInner {
                config,
                router,
                connector,
                statistics: Arc::new(Statistics::new()),
                mocks,
                filters: RwLock::new(Vec::new()),
                store,
                discovery: Discovery::new(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// 启动维护任务；重复调用无效果。
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = tokio::spawn(maintain(Arc::downgrade(&self.inner)));
        self.inner.tasks.lock().push(handle);
        tracing::info!(store = self.inner.store.is_some(), "consumer started");
    }

    /// 停止后台任务并关闭全部连接；连接上的待决请求以通道错误完成。
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.router.set_store_active(false);
        self.inner.connector.close_all();
        self.inner.started.store(false, Ordering::Release);
        tracing::info!("consumer stopped");
    }

    /// 构造一个请求。
    pub fn request(
        &self,
        service: impl Into<String>,
        entry: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Request, ResultError> {
        let entry = entry.into();
        if entry.is_empty() {
            return Err(ResultError::new(ResultCode::REQUEST, "entry name is empty"));
        }
        Ok(Request::new(
            self.clone(),
            new_request_id(),
            service.into(),
            entry,
            params,
        ))
    }

    /// 追加一个全局过滤器工厂。
    pub fn add_filter<F>(&self, factory: F)
    where
        F: Fn() -> Box<dyn ConsumerFilter> + Send + Sync + 'static,
    {
        self.inner.filters.write().push(Arc::new(factory));
    }

    pub fn clear_filters(&self) {
        self.inner.filters.write().clear();
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    pub fn mocks(&self) -> &MockRegistry {
        &self.inner.mocks
    }

    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.inner.store.as_ref()
    }

    /// 当前登记在各索引中的待决请求数。
    pub fn pending_requests(&self) -> usize {
        self.inner.connector.pending_count()
    }

    /// 立即全量重载注册表；未配置存储时返回 0。
    pub async fn reload_registry(&self) -> Result<usize, UbsiError> {
        match &self.inner.store {
            Some(store) => {
                self.inner
                    .discovery
                    .load_all(&self.inner.router, store.as_ref())
                    .await
            }
            None => Ok(0),
        }
    }

    pub(crate) fn connector(&self) -> &Arc<Connector> {
        &self.inner.connector
    }

    pub(crate) fn instantiate_filters(&self) -> Vec<Box<dyn ConsumerFilter>> {
        self.inner.filters.read().iter().map(|f| f()).collect()
    }

    pub(crate) fn message_ready(&self) -> bool {
        self.inner.store.is_some() && self.inner.router.store_active()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("router", &self.inner.router)
            .field("connector", &self.inner.connector)
            .field("store", &self.inner.store.is_some())
            .finish()
    }
}

impl ConsumerInner {
    /// 订阅通知通道并全量加载注册表。
    async fn attach_store(self: &Arc<Self>, store: &Arc<dyn Store>) -> Result<(), UbsiError> {
        let subscription = store.subscribe(NOTIFY_CHANNEL).await?;
        let listener = tokio::spawn(listen(Arc::downgrade(self), subscription));
        if let Err(err) = self.discovery.load_all(&self.router, store.as_ref()).await {
            listener.abort();
            return Err(err);
        }
        self.tasks.lock().push(listener);
        self.router.set_store_active(true);
        Ok(())
    }
}

async fn listen(weak: Weak<ConsumerInner>, mut subscription: Subscription) {
    while let Some(message) = subscription.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match message {
            StoreMessage::Text(text) => inner.discovery.push(text),
            StoreMessage::Binary(bytes) => {
                inner.connector.deliver_message(&bytes);
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.router.set_store_active(false);
        tracing::warn!("notification subscription lost");
    }
}

async fn maintain(weak: Weak<ConsumerInner>) {
    let (tick, sweep_every) = match weak.upgrade() {
        Some(inner) => (
            Duration::from_millis(inner.config.tick_ms),
            Duration::from_millis(inner.config.sweep_interval_ms),
        ),
        None => return,
    };
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sweep = Instant::now();
    let mut store_retry_at = Instant::now();
    let mut store_backoff = STORE_RETRY_MIN;

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let now = Instant::now();
        if now.duration_since(last_sweep) >= sweep_every {
            inner.connector.sweep(now.into_std());
            last_sweep = now;
        }

        let Some(store) = inner.store.clone() else {
            continue;
        };
        if !inner.router.store_active() {
            if now >= store_retry_at {
                match inner.attach_store(&store).await {
                    Ok(()) => store_backoff = STORE_RETRY_MIN,
                    Err(err) => {
                        tracing::warn!(error = %err, retry_in = ?store_backoff, "backing store unavailable");
                        store_retry_at = now + store_backoff;
                        store_backoff = (store_backoff * 2).min(STORE_RETRY_MAX);
                    }
                }
            }
            continue;
        }
        if let Err(err) = inner.discovery.process(&inner.router, store.as_ref()).await {
            tracing::warn!(error = %err, "heartbeat processing failed");
        }
        if let Err(err) = inner.discovery.purge_if_due(&inner.router, store.as_ref()).await {
            tracing::warn!(error = %err, "registry purge failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tracing_test::traced_test;

    /// 任何操作都失败的存储。
    struct DownStore;

    fn refused<T>() -> Result<T, UbsiError> {
        Err(UbsiError::Store {
            message: "connection refused".to_owned(),
        })
    }

    #[async_trait]
    impl Store for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, UbsiError> {
            refused()
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<(), UbsiError> {
            refused()
        }
        async fn set_nx(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<bool, UbsiError> {
            refused()
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, UbsiError> {
            refused()
        }
        async fn hget(&self, _key: &str, _field: &str) -> Result<Option<Bytes>, UbsiError> {
            refused()
        }
        async fn hset(&self, _key: &str, _field: &str, _value: Bytes) -> Result<(), UbsiError> {
            refused()
        }
        async fn hdel(&self, _key: &str, _field: &str) -> Result<bool, UbsiError> {
            refused()
        }
        async fn hgetall(&self, _key: &str) -> Result<Vec<(String, Bytes)>, UbsiError> {
            refused()
        }
        async fn publish(&self, _channel: &str, _message: StoreMessage) -> Result<(), UbsiError> {
            refused()
        }
        async fn subscribe(&self, _channel: &str) -> Result<Subscription, UbsiError> {
            refused()
        }
    }

    // 单线程运行时：维护任务与测试体同线程，日志落在测试 span 内
    #[tokio::test]
    #[traced_test]
    async fn unavailable_store_is_logged_and_not_attached() {
        let consumer = Consumer::new(ConsumerConfig::default(), Some(Arc::new(DownStore))).unwrap();
        consumer.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(logs_contain("backing store unavailable"));
        assert!(!consumer.message_ready());
        let err = consumer.reload_registry().await.unwrap_err();
        assert_eq!(err.code(), ResultCode::MESSAGE);
        consumer.shutdown();
    }
}
