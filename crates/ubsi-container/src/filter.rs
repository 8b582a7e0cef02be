//! 容器端全局过滤器。

use crate::context::ServiceContext;
use crate::module::panic_message;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use ubsi_core::registry::{FilterRecord, STATUS_RUNNING};
use ubsi_core::{ResultCode, ResultError};

/// 每个请求新建一次的过滤器实例。
///
/// `before` 返回错误时请求以该错误结束，后续过滤器与服务都不再执行；
/// 已执行过 `before` 的过滤器仍会按逆序执行 `after`。
pub trait ContainerFilter: Send {
    fn before(&mut self, _ctx: &mut ServiceContext) -> Result<(), ResultError> {
        Ok(())
    }

    fn after(&mut self, _ctx: &mut ServiceContext) {}
}

pub type ContainerFilterFactory = Arc<dyn Fn() -> Box<dyn ContainerFilter> + Send + Sync>;

/// 过滤器的静态描述。
#[derive(Clone)]
pub struct FilterDescriptor {
    pub class_name: String,
    pub version: u32,
    pub release: bool,
    /// 单步超时，用于熔断判定与注册记录中的超时标记。
    pub timeout: Duration,
    factory: ContainerFilterFactory,
}

impl FilterDescriptor {
    pub fn new<F>(class_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ContainerFilter> + Send + Sync + 'static,
    {
        Self {
            class_name: class_name.into(),
            version: 1_000_000,
            release: true,
            timeout: Duration::from_secs(10),
            factory: Arc::new(factory),
        }
    }

    pub fn version(mut self, version: u32, release: bool) -> Self {
        self.version = version;
        self.release = release;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("class_name", &self.class_name)
            .field("version", &self.version)
            .field("release", &self.release)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// 已安装的过滤器。
#[derive(Debug)]
pub(crate) struct HostedFilter {
    descriptor: FilterDescriptor,
    status: AtomicI32,
}

impl HostedFilter {
    pub(crate) fn new(descriptor: FilterDescriptor) -> Self {
        Self {
            descriptor,
            status: AtomicI32::new(STATUS_RUNNING),
        }
    }

    pub(crate) fn descriptor(&self) -> &FilterDescriptor {
        &self.descriptor
    }

    pub(crate) fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.status() == STATUS_RUNNING
    }

    pub(crate) fn record(&self, timeout: bool) -> FilterRecord {
        FilterRecord {
            class_name: self.descriptor.class_name.clone(),
            version: self.descriptor.version,
            release: self.descriptor.release,
            status: self.status(),
            timeout,
        }
    }
}

/// 一个请求上实例化的过滤器。
pub(crate) struct ActiveFilter {
    pub(crate) class_name: String,
    pub(crate) timeout: Duration,
    instance: Box<dyn ContainerFilter>,
}

impl ActiveFilter {
    /// 实例化；工厂 panic 时返回 `None`。
    pub(crate) fn instantiate(hosted: &HostedFilter) -> Option<Self> {
        let descriptor = hosted.descriptor();
        match catch_unwind(AssertUnwindSafe(|| (descriptor.factory)())) {
            Ok(instance) => Some(Self {
                class_name: descriptor.class_name.clone(),
                timeout: descriptor.timeout,
                instance,
            }),
            Err(panic) => {
                tracing::error!(filter = %descriptor.class_name, panic = %panic_message(panic.as_ref()), "filter factory panicked");
                None
            }
        }
    }

    /// 执行 `before`，panic 视为异常结果。
    pub(crate) fn before(&mut self, ctx: &mut ServiceContext) -> Result<(), ResultError> {
        match catch_unwind(AssertUnwindSafe(|| self.instance.before(ctx))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(filter = %self.class_name, req_id = %ctx.request_id(), panic = %message, "filter before panicked");
                Err(ResultError::new(ResultCode::EXCEPTION, message))
            }
        }
    }

    pub(crate) fn after(&mut self, ctx: &mut ServiceContext) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.instance.after(ctx))) {
            tracing::error!(filter = %self.class_name, req_id = %ctx.request_id(), panic = %panic_message(panic.as_ref()), "filter after panicked");
        }
    }
}
