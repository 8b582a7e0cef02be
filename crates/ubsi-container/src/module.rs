//! 服务描述、模块装载与状态机。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 服务不是运行时反射出来的，而是以一份静态描述登记：接口表、参数形态与默认值、
//!   生命周期钩子与实例工厂在装载时一次性确定，分发时只查表；
//! - 模块来源（静态注册、插件、子进程……）隔离在 [`ModuleLoader`] 之后，
//!   容器只消费装载、启动、停止、暂停/恢复与状态查询。
//!
//! ## 逻辑 (How)
//! - [`ServiceDescriptor`] 以构建器方式声明接口、依赖与钩子，实例工厂每个请求调用一次；
//! - [`HostedService`] 持有描述与原子状态：停止(0) → 运行(1) ⇄ 暂停(-1)，
//!   单例在检测到他处存活实例时停在等待(-2)，由发布任务在每次刷新时重试。
//!
//! ## 契约 (What)
//! - 初始化钩子失败时服务保持停止；钩子中的 panic 被捕获并转换为 [`ContainerError::Hook`]；
//! - 状态值与注册记录中的 `status` 字段一一对应。

use crate::context::ServiceContext;
use crate::error::ContainerError;
use crate::filter::FilterDescriptor;
use crate::params::{ParamDescriptor, ValueShape};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;
use ubsi_core::registry::{
    STATUS_PAUSED, STATUS_RUNNING, STATUS_SINGLETON_WAITING, STATUS_STOPPED, ServiceRecord,
};
use ubsi_core::{ResultError, Value};

/// 每个请求新建一次的服务实例。
///
/// `before` 与 `after` 对应服务级前后置钩子；`after` 无论接口是否成功都会执行。
pub trait ServiceInstance: Send {
    fn before(&mut self, _ctx: &mut ServiceContext) -> Result<(), ResultError> {
        Ok(())
    }

    fn invoke(
        &mut self,
        entry: &str,
        ctx: &mut ServiceContext,
        params: Vec<Value>,
    ) -> Result<Value, ResultError>;

    fn after(&mut self, _ctx: &mut ServiceContext) -> Result<(), ResultError> {
        Ok(())
    }
}

pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn ServiceInstance> + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn() -> Result<(), ResultError> + Send + Sync>;
pub type InfoHook = Arc<dyn Fn() -> Value + Send + Sync>;
pub type ConfigHook = Arc<dyn Fn(Value) -> Result<(), ResultError> + Send + Sync>;

/// 可选的模块级钩子。
#[derive(Clone, Default)]
pub struct ServiceHooks {
    pub init: Option<LifecycleHook>,
    pub close: Option<LifecycleHook>,
    pub info: Option<InfoHook>,
    pub config_get: Option<InfoHook>,
    pub config_set: Option<ConfigHook>,
}

impl std::fmt::Debug for ServiceHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHooks")
            .field("init", &self.init.is_some())
            .field("close", &self.close.is_some())
            .field("info", &self.info.is_some())
            .field("config_get", &self.config_get.is_some())
            .field("config_set", &self.config_set.is_some())
            .finish()
    }
}

/// 依赖声明，只用于展示。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub service: String,
    pub version_min: u32,
    pub version_max: u32,
    pub release: Option<bool>,
}

/// 一个接口的声明。
#[derive(Debug, Clone)]
pub struct EntryDescriptor {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
    pub returns: ValueShape,
    /// 只读接口仅需读权限。
    pub readonly: bool,
    /// 覆盖服务级超时。
    pub timeout: Option<Duration>,
}

impl EntryDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: ValueShape::Any,
            readonly: false,
            timeout: None,
        }
    }

    pub fn param(mut self, param: ParamDescriptor) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, shape: ValueShape) -> Self {
        self.returns = shape;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 服务的静态描述。
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub class_name: String,
    pub version: u32,
    pub release: bool,
    pub singleton: bool,
    /// 接口默认超时，用于熔断判定。
    pub timeout: Duration,
    pub dependencies: Vec<Dependency>,
    pub entries: Vec<EntryDescriptor>,
    pub hooks: ServiceHooks,
    factory: ServiceFactory,
}

impl ServiceDescriptor {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ServiceInstance> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            class_name: name.clone(),
            name,
            version: 1_000_000,
            release: true,
            singleton: false,
            timeout: Duration::from_secs(10),
            dependencies: Vec::new(),
            entries: Vec::new(),
            hooks: ServiceHooks::default(),
            factory: Arc::new(factory),
        }
    }

    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn version(mut self, version: u32, release: bool) -> Self {
        self.version = version;
        self.release = release;
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn entry(mut self, entry: EntryDescriptor) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn hooks(mut self, hooks: ServiceHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn find_entry(&self, name: &str) -> Option<&EntryDescriptor> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// 接口的生效超时。
    pub fn entry_timeout(&self, entry: &EntryDescriptor) -> Duration {
        entry.timeout.unwrap_or(self.timeout)
    }

    pub(crate) fn instantiate(&self) -> Box<dyn ServiceInstance> {
        (self.factory)()
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("class_name", &self.class_name)
            .field("version", &self.version)
            .field("release", &self.release)
            .field("singleton", &self.singleton)
            .field("entries", &self.entries.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// 模块来源。
pub trait ModuleLoader: Send + Sync {
    fn load_service(&self, name: &str) -> Result<ServiceDescriptor, ContainerError>;

    fn load_filter(&self, class_name: &str) -> Result<FilterDescriptor, ContainerError>;
}

/// 以代码登记描述的装载器。
#[derive(Default)]
pub struct StaticModuleLoader {
    services: HashMap<String, ServiceDescriptor>,
    filters: HashMap<String, FilterDescriptor>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn with_filter(mut self, descriptor: FilterDescriptor) -> Self {
        self.filters.insert(descriptor.class_name.clone(), descriptor);
        self
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load_service(&self, name: &str) -> Result<ServiceDescriptor, ContainerError> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::Load {
                name: name.to_owned(),
                reason: "no such service module".to_owned(),
            })
    }

    fn load_filter(&self, class_name: &str) -> Result<FilterDescriptor, ContainerError> {
        self.filters
            .get(class_name)
            .cloned()
            .ok_or_else(|| ContainerError::Load {
                name: class_name.to_owned(),
                reason: "no such filter module".to_owned(),
            })
    }
}

impl std::fmt::Debug for StaticModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticModuleLoader")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 已装载的服务。
#[derive(Debug)]
pub(crate) struct HostedService {
    descriptor: ServiceDescriptor,
    status: AtomicI32,
    deal: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl HostedService {
    pub(crate) fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            status: AtomicI32::new(STATUS_STOPPED),
            deal: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub(crate) fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    /// 生命周期操作互斥，避免启动与停止交错。
    pub(crate) async fn lock_lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    pub(crate) fn try_lock_lifecycle(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>, tokio::sync::TryLockError> {
        self.lifecycle.try_lock()
    }

    pub(crate) fn count_deal(&self) {
        self.deal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn run_init(&self) -> Result<(), ContainerError> {
        self.run_hook(self.descriptor.hooks.init.as_ref())
    }

    pub(crate) fn run_close(&self) -> Result<(), ContainerError> {
        self.run_hook(self.descriptor.hooks.close.as_ref())
    }

    fn run_hook(&self, hook: Option<&LifecycleHook>) -> Result<(), ContainerError> {
        let Some(hook) = hook else {
            return Ok(());
        };
        match catch_unwind(AssertUnwindSafe(|| hook())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ContainerError::Hook {
                name: self.name().to_owned(),
                message: err.message,
            }),
            Err(panic) => Err(ContainerError::Hook {
                name: self.name().to_owned(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    pub(crate) fn record(&self, timeout: bool) -> ServiceRecord {
        ServiceRecord {
            class_name: self.descriptor.class_name.clone(),
            version: self.descriptor.version,
            release: self.descriptor.release,
            status: self.status(),
            timeout,
            deal: self.deal.load(Ordering::Relaxed),
            singleton: self.descriptor.singleton,
        }
    }
}

/// 状态码的可读名称。
pub fn status_label(status: i32) -> &'static str {
    match status {
        STATUS_STOPPED => "stopped",
        STATUS_RUNNING => "running",
        STATUS_PAUSED => "paused",
        STATUS_SINGLETON_WAITING => "singleton-waiting",
        _ => "unknown",
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}
