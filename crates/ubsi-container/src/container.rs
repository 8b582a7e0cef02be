//! 容器运行时对象：启动、停止与模块管理接口。

use crate::acceptor;
use crate::acl::AccessControl;
use crate::admin::{self, ADMIN_SERVICE};
use crate::config::ContainerConfig;
use crate::error::ContainerError;
use crate::filter::{FilterDescriptor, HostedFilter};
use crate::fuse::DealingTable;
use crate::module::{
    Dependency, HostedService, ModuleLoader, ServiceDescriptor, panic_message, status_label,
};
use crate::publisher;
use crate::singleton;
use crate::stats::ContainerStats;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use ubsi_consumer::Consumer;
use ubsi_core::lock::NamedLock;
use ubsi_core::registry::{
    STATUS_PAUSED, STATUS_RUNNING, STATUS_SINGLETON_WAITING, STATUS_STOPPED, container_name,
};
use ubsi_core::time::system_clock;
use ubsi_core::util::{format_version, new_request_id};
use ubsi_core::{Clock, Store, UbsiError, Value};
use ubsi_transport_tcp::TcpListener;

/// 停止时等待在途请求完成的上限。
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// 服务容器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 托管一组服务模块，对外以分帧 TCP 提供调用入口，并把自身的服务表与负载
///   发布到共享注册表，供调用端路由；
/// - 服务表、过滤器表、在途调用表与计数器都归属于这一个运行时对象，不存在进程级全局状态。
///
/// ## 逻辑 (How)
/// - [`Container::start`]：先启动内嵌调用端（注册表视图与转发通道），再绑定监听端口；
///   绑定失败时回收已启动的部分并返回 [`ContainerError::Bind`]；
///   随后启动接入任务与发布任务，并立即发布一次完整记录；
/// - 接入任务对每个请求做准入判定，受理后交给有界工作线程池执行分发流水线；
/// - [`Container::stop`]：拒绝新请求并等待在途请求，关闭服务与后台任务后注销注册记录。
///
/// ## 契约 (What)
/// - 模块管理接口（安装、启动、停止、暂停、恢复、状态、信息、配置）可在启动前后调用；
///   单例服务的启动需要注册表视图，宜在容器启动后进行；
/// - 服务名空串保留给内置管理服务，它随容器创建即处于运行状态，不能经模块管理接口改动；
/// - 后台任务持有运行时的强引用，必须调用 `stop` 才会释放。
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

pub(crate) struct ContainerInner {
    pub(crate) config: ContainerConfig,
    pub(crate) loader: Arc<dyn ModuleLoader>,
    pub(crate) name: RwLock<String>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) services: DashMap<String, Arc<HostedService>>,
    pub(crate) filters: RwLock<Vec<Arc<HostedFilter>>>,
    pub(crate) consumer: Consumer,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) lock: NamedLock,
    pub(crate) acl: AccessControl,
    pub(crate) dealing: DealingTable,
    pub(crate) stats: ContainerStats,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) flush: Notify,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ContainerInner {
    pub(crate) fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn service(&self, name: &str) -> Result<Arc<HostedService>, ContainerError> {
        self.services
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ContainerError::NoService(name.to_owned()))
    }

    /// 唤醒发布任务，立即写出完整记录。
    pub(crate) fn request_flush(&self) {
        self.flush.notify_one();
    }
}

impl Container {
    pub fn new(
        config: ContainerConfig,
        loader: Arc<dyn ModuleLoader>,
        store: Option<Arc<dyn Store>>,
    ) -> Result<Self, ContainerError> {
        let config = config.normalized();
        let consumer = Consumer::new(config.consumer.clone(), store.clone())?;
        let name = container_name(&config.host, config.port);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new_cyclic(|weak: &Weak<ContainerInner>| ContainerInner {
                acl: config.access_control(),
                workers: Arc::new(Semaphore::new(config.work_threads as usize)),
                lock: NamedLock::new(store.clone(), new_request_id()),
                name: RwLock::new(name),
                clock: system_clock(),
                services: DashMap::from_iter([(
                    ADMIN_SERVICE.to_owned(),
                    Arc::new(admin::hosted(Weak::clone(weak))),
                )]),
                filters: RwLock::new(Vec::new()),
                consumer,
                store,
                loader,
                dealing: DealingTable::new(),
                stats: ContainerStats::new(),
                shutting_down: AtomicBool::new(false),
                shutdown,
                flush: Notify::new(),
                started: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ContainerInner>) -> Self {
        Self { inner }
    }

    /// 启动容器，返回实际监听地址。
    pub async fn start(&self) -> Result<SocketAddr, ContainerError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(ContainerError::AlreadyStarted);
        }
        inner.consumer.start();

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, "container startup aborted");
                inner.consumer.shutdown();
                inner.started.store(false, Ordering::Release);
                return Err(err);
            }
        };
        let local = listener.local_addr();
        *inner.name.write() = container_name(&inner.config.host, local.port());
        *inner.local_addr.lock() = Some(local);
        inner.shutting_down.store(false, Ordering::Release);
        inner.shutdown.send_replace(false);

        let acceptor = tokio::spawn(acceptor::run(Arc::clone(inner), listener));
        let publisher = tokio::spawn(publisher::run(Arc::clone(inner)));
        inner.tasks.lock().extend([acceptor, publisher]);
        inner.request_flush();
        tracing::info!(container = %inner.name(), addr = %local, "container started");
        Ok(local)
    }

    async fn bind(&self) -> Result<TcpListener, ContainerError> {
        let config = &self.inner.config;
        let text = format!("{}:{}", config.host, config.port);
        let addr = tokio::net::lookup_host(&text)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| UbsiError::config(format!("cannot resolve listen address {text}")))?;
        TcpListener::bind(addr, config.backlog)
            .map_err(|source| ContainerError::Bind { addr: text, source })
    }

    /// 停止容器；未启动时无效果。
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        inner.shutting_down.store(true, Ordering::Release);
        let permits = inner.config.work_threads;
        match tokio::time::timeout(SHUTDOWN_GRACE, inner.workers.acquire_many(permits)).await {
            Ok(Ok(drained)) => drop(drained),
            _ => tracing::warn!(waiting = inner.stats.waiting(), "in-flight requests abandoned"),
        }

        for entry in inner.services.iter() {
            let service = entry.value();
            if entry.key() != ADMIN_SERVICE && service.status() != STATUS_STOPPED {
                if let Err(err) = service.run_close() {
                    tracing::warn!(service = %service.name(), error = %err, "close hook failed");
                }
                service.set_status(STATUS_STOPPED);
            }
        }
        inner.shutdown.send_replace(true);
        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        publisher::deregister(inner).await;
        inner.consumer.shutdown();
        tracing::info!(container = %inner.name(), "container stopped");
    }

    /// 容器名（`host#port`）；启动前端口为配置值。
    pub fn name(&self) -> String {
        self.inner.name()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }

    /// 内嵌调用端，可用于从服务内部调用其他服务。
    pub fn consumer(&self) -> &Consumer {
        &self.inner.consumer
    }

    pub fn stats(&self) -> &ContainerStats {
        &self.inner.stats
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ContainerInner> {
        &self.inner
    }

    /// 经模块装载器安装服务。
    pub fn install(&self, name: &str) -> Result<(), ContainerError> {
        let descriptor = self.inner.loader.load_service(name)?;
        self.install_descriptor(descriptor)
    }

    /// 直接以描述安装服务；同名服务必须处于停止状态，否则拒绝替换。
    pub fn install_descriptor(&self, descriptor: ServiceDescriptor) -> Result<(), ContainerError> {
        let name = descriptor.name.clone();
        if name == ADMIN_SERVICE {
            return Err(ContainerError::Reserved(name));
        }
        if let Some(existing) = self.inner.services.get(&name)
            && existing.status() != STATUS_STOPPED
        {
            return Err(ContainerError::Transition {
                name,
                action: "reinstall",
                status: existing.status(),
            });
        }
        tracing::info!(service = %name, version = %format_version(descriptor.version), "service installed");
        self.inner
            .services
            .insert(name, Arc::new(HostedService::new(descriptor)));
        self.inner.request_flush();
        Ok(())
    }

    /// 卸载已停止的服务。
    pub fn uninstall(&self, name: &str) -> Result<(), ContainerError> {
        let service = self.managed(name)?;
        if service.status() != STATUS_STOPPED {
            return Err(transition(&service, "uninstall"));
        }
        self.inner.services.remove(name);
        self.inner.request_flush();
        Ok(())
    }

    /// 启动服务，返回启动后的状态（运行或单例等待）。
    pub async fn start_service(&self, name: &str) -> Result<i32, ContainerError> {
        let service = self.managed(name)?;
        let _guard = service.lock_lifecycle().await;
        match service.status() {
            STATUS_RUNNING => return Ok(STATUS_RUNNING),
            STATUS_PAUSED => return Err(transition(&service, "start")),
            _ => {}
        }
        let status = if service.descriptor().singleton {
            singleton::try_start(&self.inner, &service).await?
        } else {
            service.run_init()?;
            STATUS_RUNNING
        };
        service.set_status(status);
        self.inner.request_flush();
        tracing::info!(service = %name, status = status_label(status), "service started");
        Ok(status)
    }

    /// 停止服务并执行关闭钩子；钩子失败不阻止停止。
    pub async fn stop_service(&self, name: &str) -> Result<(), ContainerError> {
        let service = self.managed(name)?;
        let _guard = service.lock_lifecycle().await;
        if service.status() == STATUS_STOPPED {
            return Ok(());
        }
        let was_running = service.status() != STATUS_SINGLETON_WAITING;
        service.set_status(STATUS_STOPPED);
        self.inner.request_flush();
        if was_running && let Err(err) = service.run_close() {
            tracing::warn!(service = %name, error = %err, "close hook failed");
        }
        tracing::info!(service = %name, "service stopped");
        Ok(())
    }

    pub async fn pause_service(&self, name: &str) -> Result<(), ContainerError> {
        self.switch(name, STATUS_RUNNING, STATUS_PAUSED, "pause").await
    }

    pub async fn resume_service(&self, name: &str) -> Result<(), ContainerError> {
        self.switch(name, STATUS_PAUSED, STATUS_RUNNING, "resume").await
    }

    async fn switch(
        &self,
        name: &str,
        from: i32,
        to: i32,
        action: &'static str,
    ) -> Result<(), ContainerError> {
        let service = self.managed(name)?;
        let _guard = service.lock_lifecycle().await;
        if service.status() != from {
            return Err(transition(&service, action));
        }
        service.set_status(to);
        self.inner.request_flush();
        tracing::info!(service = %name, status = status_label(to), "service status changed");
        Ok(())
    }

    /// 可经模块管理接口改动的服务。
    fn managed(&self, name: &str) -> Result<Arc<HostedService>, ContainerError> {
        if name == ADMIN_SERVICE {
            return Err(ContainerError::Reserved(name.to_owned()));
        }
        self.inner.service(name)
    }

    pub fn service_status(&self, name: &str) -> Option<i32> {
        self.inner.services.get(name).map(|s| s.status())
    }

    /// 已安装服务及其状态，按名称排序。
    pub fn services(&self) -> Vec<(String, i32)> {
        let mut all: Vec<_> = self
            .inner
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.status()))
            .collect();
        all.sort();
        all
    }

    /// 服务信息：有信息钩子时取其返回值，否则返回描述摘要。
    pub fn service_info(&self, name: &str) -> Result<Value, ContainerError> {
        let service = self.inner.service(name)?;
        let descriptor = service.descriptor();
        if let Some(hook) = &descriptor.hooks.info {
            return call_hook(name, || hook());
        }
        Ok(Value::string_map([
            ("name", Value::from(descriptor.name.as_str())),
            ("class", Value::from(descriptor.class_name.as_str())),
            ("version", Value::from(format_version(descriptor.version))),
            ("release", Value::Bool(descriptor.release)),
            ("singleton", Value::Bool(descriptor.singleton)),
            ("status", Value::from(status_label(service.status()))),
            (
                "entries",
                Value::List(
                    descriptor
                        .entries
                        .iter()
                        .map(|e| Value::from(e.name.as_str()))
                        .collect(),
                ),
            ),
        ]))
    }

    /// 读取服务配置；没有配置钩子时返回 `Null`。
    pub fn service_config(&self, name: &str) -> Result<Value, ContainerError> {
        let service = self.inner.service(name)?;
        match &service.descriptor().hooks.config_get {
            Some(hook) => call_hook(name, || hook()),
            None => Ok(Value::Null),
        }
    }

    pub fn set_service_config(&self, name: &str, config: Value) -> Result<(), ContainerError> {
        let service = self.inner.service(name)?;
        let Some(hook) = &service.descriptor().hooks.config_set else {
            return Err(ContainerError::Hook {
                name: name.to_owned(),
                message: "service accepts no configuration".to_owned(),
            });
        };
        call_hook(name, || hook(config))?.map_err(|err| ContainerError::Hook {
            name: name.to_owned(),
            message: err.message,
        })
    }

    pub fn dependencies(&self, name: &str) -> Result<Vec<Dependency>, ContainerError> {
        Ok(self.inner.service(name)?.descriptor().dependencies.clone())
    }

    /// 经模块装载器安装过滤器。
    pub fn install_filter(&self, class_name: &str) -> Result<(), ContainerError> {
        let descriptor = self.inner.loader.load_filter(class_name)?;
        self.add_filter(descriptor);
        Ok(())
    }

    /// 追加过滤器，同名者被替换并保持原位置。
    pub fn add_filter(&self, descriptor: FilterDescriptor) {
        let hosted = Arc::new(HostedFilter::new(descriptor));
        {
            let mut filters = self.inner.filters.write();
            let class_name = &hosted.descriptor().class_name;
            match filters
                .iter()
                .position(|f| f.descriptor().class_name == *class_name)
            {
                Some(idx) => filters[idx] = hosted,
                None => filters.push(hosted),
            }
        }
        self.inner.request_flush();
    }

    pub fn remove_filter(&self, class_name: &str) -> Result<(), ContainerError> {
        let mut filters = self.inner.filters.write();
        let before = filters.len();
        filters.retain(|f| f.descriptor().class_name != class_name);
        if filters.len() == before {
            return Err(ContainerError::NoFilter(class_name.to_owned()));
        }
        drop(filters);
        self.inner.request_flush();
        Ok(())
    }

    /// 设置过滤器状态；非运行状态的过滤器在分发时被跳过。
    pub fn set_filter_status(&self, class_name: &str, status: i32) -> Result<(), ContainerError> {
        let filters = self.inner.filters.read();
        let filter = filters
            .iter()
            .find(|f| f.descriptor().class_name == class_name)
            .ok_or_else(|| ContainerError::NoFilter(class_name.to_owned()))?;
        filter.set_status(status);
        drop(filters);
        self.inner.request_flush();
        Ok(())
    }

    /// 已安装过滤器及其状态，按执行顺序排列。
    pub fn filters(&self) -> Vec<(String, i32)> {
        self.inner
            .filters
            .read()
            .iter()
            .map(|f| (f.descriptor().class_name.clone(), f.status()))
            .collect()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.inner.name())
            .field("services", &self.inner.services.len())
            .field("filters", &self.inner.filters.read().len())
            .field("store", &self.inner.store.is_some())
            .finish()
    }
}

fn transition(service: &HostedService, action: &'static str) -> ContainerError {
    ContainerError::Transition {
        name: service.name().to_owned(),
        action,
        status: service.status(),
    }
}

fn call_hook<T>(name: &str, hook: impl FnOnce() -> T) -> Result<T, ContainerError> {
    catch_unwind(AssertUnwindSafe(hook)).map_err(|panic| ContainerError::Hook {
        name: name.to_owned(),
        message: panic_message(panic.as_ref()),
    })
}
