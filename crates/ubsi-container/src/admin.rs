//! 内置管理服务：服务名为空串，经线协议查看与管理运行中的容器。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 运维工具手里只有容器地址，需要远程查看运行计数与在途请求，并启停模块、改写配置与模拟数据；
//! - 管理服务以普通托管服务的身份登记，因此同样经过过滤器、参数对齐、访问控制、统计与熔断，
//!   也随注册记录一起公布。
//!
//! ## 逻辑 (How)
//! - 实例持有容器的弱引用：读接口直接读取运行时状态，写接口委托给 [`Container`] 的模块管理接口；
//! - 生命周期接口是异步的，工作线程不在异步上下文中，以 `Handle::block_on` 等待其完成。
//!
//! ## 契约 (What)
//! - `get*` 接口只读，只需读权限；其余接口需要写权限；
//! - 模块管理失败返回 [`ResultCode::ERROR`]，实参类型不符返回 [`ResultCode::PARAMS`]；
//! - `setStatus` 的动作取值：0 停止，负数暂停，正数启动或恢复；返回是否生效。

use crate::container::{Container, ContainerInner};
use crate::context::ServiceContext;
use crate::error::ContainerError;
use crate::module::{
    Dependency, EntryDescriptor, HostedService, ServiceDescriptor, ServiceInstance,
};
use crate::params::{ParamDescriptor, ValueShape};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use ubsi_core::registry::{
    STATUS_PAUSED, STATUS_RUNNING, STATUS_SINGLETON_WAITING, STATUS_STOPPED,
};
use ubsi_core::util::{format_version, parse_version};
use ubsi_core::{ResultCode, ResultError, Value};

/// 管理服务的服务名。
pub(crate) const ADMIN_SERVICE: &str = "";

/// 已处于运行状态的管理服务。
pub(crate) fn hosted(inner: Weak<ContainerInner>) -> HostedService {
    let service = HostedService::new(descriptor(inner));
    service.set_status(STATUS_RUNNING);
    service
}

fn descriptor(inner: Weak<ContainerInner>) -> ServiceDescriptor {
    let version = parse_version(env!("CARGO_PKG_VERSION")).unwrap_or_default();
    ServiceDescriptor::new(ADMIN_SERVICE, move || {
        Box::new(Admin {
            inner: Weak::clone(&inner),
        }) as Box<dyn ServiceInstance>
    })
    .class_name("ubsi-container::admin")
    .version(version, false)
    .entry(query("getRuntime").param(nullable("name")))
    .entry(query("getDealing").param(nullable("service")))
    .entry(query("getEntry").param(name("service")))
    .entry(query("getDepend").param(name("name")))
    .entry(query("getConfig").param(name("name")))
    .entry(query("getMockData").param(name("service")).param(name("entry")))
    .entry(
        EntryDescriptor::new("install")
            .param(name("name"))
            .param(ParamDescriptor::new("filter", ValueShape::Bool).default_literal("false")),
    )
    .entry(EntryDescriptor::new("uninstall").param(name("name")))
    .entry(
        EntryDescriptor::new("setStatus")
            .param(name("name"))
            .param(ParamDescriptor::new("action", ValueShape::Int))
            .returns(ValueShape::Bool),
    )
    .entry(EntryDescriptor::new("restart").param(name("name")))
    .entry(
        EntryDescriptor::new("setConfig")
            .param(name("name"))
            .param(ParamDescriptor::new("config", ValueShape::Any)),
    )
    .entry(
        EntryDescriptor::new("setMockData")
            .param(name("service"))
            .param(name("entry"))
            .param(ParamDescriptor::new("data", ValueShape::Any)),
    )
    .entry(
        EntryDescriptor::new("setMockClear")
            .param(name("service"))
            .param(name("entry"))
            .returns(ValueShape::Bool),
    )
    .entry(EntryDescriptor::new("shutdown"))
}

fn query(entry: &str) -> EntryDescriptor {
    EntryDescriptor::new(entry).readonly(true)
}

fn name(param: &str) -> ParamDescriptor {
    ParamDescriptor::new(param, ValueShape::Str)
}

fn nullable(param: &str) -> ParamDescriptor {
    ParamDescriptor::new(param, ValueShape::Any).default_literal("null")
}

struct Admin {
    inner: Weak<ContainerInner>,
}

impl ServiceInstance for Admin {
    fn invoke(
        &mut self,
        entry: &str,
        ctx: &mut ServiceContext,
        params: Vec<Value>,
    ) -> Result<Value, ResultError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| ResultError::new(ResultCode::SHUTDOWN, "container released"))?;
        let container = Container::from_inner(Arc::clone(&inner));
        let args = Args(params);
        match entry {
            "getRuntime" => match args.nullable(0)? {
                None => Ok(runtime(&inner)),
                Some(name) => module_info(&container, &inner, name),
            },
            "getDealing" => Ok(dealing(&inner, args.nullable(0)?)),
            "getEntry" => entries(&inner, args.text(0)?),
            "getDepend" => container
                .dependencies(args.text(0)?)
                .map(|deps| dependencies(&deps))
                .map_err(failed),
            "getConfig" => container.service_config(args.text(0)?).map_err(failed),
            "getMockData" => Ok(inner
                .consumer
                .mocks()
                .lookup(args.text(0)?, args.text(1)?)
                .unwrap_or(Value::Null)),
            "install" => {
                let name = args.text(0)?;
                if args.flag(1)? {
                    container.install_filter(name).map_err(failed)?;
                } else {
                    container.install(name).map_err(failed)?;
                }
                Ok(Value::Null)
            }
            "uninstall" => {
                let name = args.text(0)?;
                match container.uninstall(name) {
                    Err(ContainerError::NoService(_)) => container.remove_filter(name),
                    other => other,
                }
                .map_err(failed)?;
                Ok(Value::Null)
            }
            "setStatus" => {
                set_status(&container, &inner, args.text(0)?, args.integer(1)?).map(Value::Bool)
            }
            "restart" => restart(&container, args.text(0)?).map(|()| Value::Null),
            "setConfig" => {
                container
                    .set_service_config(args.text(0)?, args.owned(1))
                    .map_err(failed)?;
                Ok(Value::Null)
            }
            "setMockData" => {
                inner
                    .consumer
                    .mocks()
                    .set(args.text(0)?, args.text(1)?, args.owned(2));
                Ok(Value::Null)
            }
            "setMockClear" => Ok(Value::Bool(
                inner
                    .consumer
                    .mocks()
                    .remove(args.text(0)?, args.text(1)?)
                    .is_some(),
            )),
            "shutdown" => {
                let handle = runtime_handle()?;
                tracing::warn!(container = %inner.name(), peer = %ctx.peer(), "shutdown requested through admin service");
                handle.spawn(async move { container.stop().await });
                Ok(Value::Null)
            }
            other => Err(ResultError::new(
                ResultCode::NOENTRY,
                format!("admin entry `{other}` not found"),
            )),
        }
    }
}

static NULL: Value = Value::Null;

/// 按位置读取的实参；缺失的位置视为 `Null`。
struct Args(Vec<Value>);

impl Args {
    fn value(&self, idx: usize) -> &Value {
        self.0.get(idx).unwrap_or(&NULL)
    }

    fn owned(&self, idx: usize) -> Value {
        self.value(idx).clone()
    }

    fn text(&self, idx: usize) -> Result<&str, ResultError> {
        self.value(idx)
            .as_str()
            .ok_or_else(|| mismatch(idx, "string", self.value(idx)))
    }

    fn nullable(&self, idx: usize) -> Result<Option<&str>, ResultError> {
        match self.value(idx) {
            Value::Null => Ok(None),
            value => value
                .as_str()
                .map(Some)
                .ok_or_else(|| mismatch(idx, "string or null", value)),
        }
    }

    fn integer(&self, idx: usize) -> Result<i64, ResultError> {
        self.value(idx)
            .as_i64()
            .ok_or_else(|| mismatch(idx, "integer", self.value(idx)))
    }

    fn flag(&self, idx: usize) -> Result<bool, ResultError> {
        match self.value(idx) {
            Value::Null => Ok(false),
            value => value
                .as_bool()
                .ok_or_else(|| mismatch(idx, "bool", value)),
        }
    }
}

fn mismatch(idx: usize, expected: &str, got: &Value) -> ResultError {
    ResultError::new(
        ResultCode::PARAMS,
        format!("parameter {idx} must be {expected}, got {}", got.kind()),
    )
}

fn failed(err: ContainerError) -> ResultError {
    ResultError::new(ResultCode::ERROR, err.to_string())
}

fn runtime_handle() -> Result<Handle, ResultError> {
    Handle::try_current().map_err(|err| ResultError::new(ResultCode::EXCEPTION, err.to_string()))
}

fn block_on<F: Future>(future: F) -> Result<F::Output, ResultError> {
    Ok(runtime_handle()?.block_on(future))
}

fn set_status(
    container: &Container,
    inner: &ContainerInner,
    name: &str,
    action: i64,
) -> Result<bool, ResultError> {
    if name == ADMIN_SERVICE {
        return Ok(false);
    }
    let Some(status) = container.service_status(name) else {
        return set_filter_status(container, name, action);
    };
    let outcome = match action {
        0 if status == STATUS_STOPPED => return Ok(false),
        // 仍有在途请求的运行中服务不允许停止
        0 if status == STATUS_RUNNING && inner.dealing.busy(name) => return Ok(false),
        0 => block_on(container.stop_service(name))?,
        a if a < 0 => {
            if status != STATUS_RUNNING {
                return Ok(false);
            }
            block_on(container.pause_service(name))?
        }
        _ => match status {
            STATUS_RUNNING | STATUS_SINGLETON_WAITING => return Ok(false),
            STATUS_PAUSED => block_on(container.resume_service(name))?,
            _ => block_on(container.start_service(name))?.map(|_| ()),
        },
    };
    outcome.map(|()| true).map_err(failed)
}

fn set_filter_status(container: &Container, name: &str, action: i64) -> Result<bool, ResultError> {
    let Some((_, status)) = container
        .filters()
        .into_iter()
        .find(|(class_name, _)| class_name == name)
    else {
        return Ok(false);
    };
    let target = match action {
        0 => STATUS_STOPPED,
        a if a < 0 => STATUS_PAUSED,
        _ => STATUS_RUNNING,
    };
    if status == target {
        return Ok(false);
    }
    container.set_filter_status(name, target).map_err(failed)?;
    Ok(true)
}

/// 重启服务；单例等待中的服务保持不动。过滤器无实例状态，重启即恢复运行。
fn restart(container: &Container, name: &str) -> Result<(), ResultError> {
    match container.service_status(name) {
        Some(STATUS_SINGLETON_WAITING) => Ok(()),
        Some(_) => {
            block_on(container.stop_service(name))?.map_err(failed)?;
            block_on(container.start_service(name))?
                .map(|_| ())
                .map_err(failed)
        }
        None => container
            .set_filter_status(name, STATUS_RUNNING)
            .map_err(failed),
    }
}

fn count(n: u64) -> Value {
    Value::Long(i64::try_from(n).unwrap_or(i64::MAX))
}

fn millis(duration: Duration) -> Value {
    Value::Long(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

fn runtime(inner: &ContainerInner) -> Value {
    let now = Instant::now();
    let counters = inner.stats.counters();
    let mut services: Vec<_> = inner
        .services
        .iter()
        .map(|entry| {
            let overdue = inner.dealing.has_overdue(entry.key(), now);
            (entry.key().clone(), entry.value().record(overdue))
        })
        .collect();
    services.sort_by(|a, b| a.0.cmp(&b.0));
    let services = services
        .into_iter()
        .map(|(name, record)| {
            let summary = Value::string_map([
                ("class_name", Value::from(record.class_name)),
                ("version", Value::from(format_version(record.version))),
                ("release", Value::Bool(record.release)),
                ("status", Value::from(record.status)),
                ("deal", count(record.deal)),
                ("dealing_timeout", Value::Bool(record.timeout)),
            ]);
            (Value::from(name), summary)
        })
        .collect();
    let filters = inner
        .filters
        .read()
        .iter()
        .map(|f| {
            let record = f.record(inner.dealing.has_overdue(&f.descriptor().class_name, now));
            Value::string_map([
                ("class_name", Value::from(record.class_name)),
                ("version", Value::from(format_version(record.version))),
                ("release", Value::Bool(record.release)),
                ("status", Value::from(record.status)),
                ("dealing_timeout", Value::Bool(record.timeout)),
            ])
        })
        .collect();
    Value::string_map([
        ("container", Value::from(inner.name())),
        ("gateway", Value::Bool(inner.config.gateway)),
        ("overload", count(u64::from(inner.config.overload))),
        (
            "client_connection",
            count(counters.sockets_connected.saturating_sub(counters.sockets_closed)),
        ),
        ("request_total", count(counters.total)),
        ("request_waiting", count(counters.waiting())),
        ("request_deal", count(counters.deal)),
        ("request_over", count(counters.over)),
        ("request_overload", count(counters.overload)),
        ("request_forward", count(counters.forward)),
        ("store_enabled", Value::Bool(inner.store.is_some())),
        ("services", Value::Map(services)),
        ("filters", Value::List(filters)),
    ])
}

/// 服务取其信息钩子或描述摘要；过滤器取其登记信息。
fn module_info(
    container: &Container,
    inner: &ContainerInner,
    name: &str,
) -> Result<Value, ResultError> {
    if inner.services.contains_key(name) {
        return container.service_info(name).map_err(failed);
    }
    let filters = inner.filters.read();
    let filter = filters
        .iter()
        .find(|f| f.descriptor().class_name == name)
        .ok_or_else(|| failed(ContainerError::NoService(name.to_owned())))?;
    let descriptor = filter.descriptor();
    Ok(Value::string_map([
        ("class_name", Value::from(descriptor.class_name.as_str())),
        ("version", Value::from(format_version(descriptor.version))),
        ("release", Value::Bool(descriptor.release)),
        ("timeout_ms", millis(descriptor.timeout)),
        ("status", Value::from(filter.status())),
    ]))
}

fn dealing(inner: &ContainerInner, service: Option<&str>) -> Value {
    Value::List(
        inner
            .dealing
            .snapshot(service, Instant::now())
            .into_iter()
            .map(|view| {
                Value::string_map([
                    ("req_id", Value::from(view.request_id)),
                    ("service", Value::from(view.service)),
                    ("entry", Value::from(view.entry)),
                    ("elapsed_ms", millis(view.elapsed)),
                    ("timeout_ms", millis(view.timeout)),
                ])
            })
            .collect(),
    )
}

fn entries(inner: &ContainerInner, name: &str) -> Result<Value, ResultError> {
    let service = inner.service(name).map_err(failed)?;
    let descriptor = service.descriptor();
    Ok(Value::List(
        descriptor
            .entries
            .iter()
            .map(|entry| {
                let stats = inner.stats.entry(name, &entry.name);
                let params = entry
                    .params
                    .iter()
                    .map(|p| Value::from(p.name.as_str()))
                    .collect();
                Value::string_map([
                    ("name", Value::from(entry.name.as_str())),
                    ("readonly", Value::Bool(entry.readonly)),
                    ("timeout_ms", millis(descriptor.entry_timeout(entry))),
                    ("params", Value::List(params)),
                    ("deal", count(stats.as_ref().map_or(0, |s| s.deal))),
                    ("errors", count(stats.as_ref().map_or(0, |s| s.errors))),
                    ("max_time_ms", count(stats.as_ref().map_or(0, |s| s.max_time_ms))),
                ])
            })
            .collect(),
    ))
}

fn dependencies(deps: &[Dependency]) -> Value {
    Value::Map(
        deps.iter()
            .map(|dep| {
                let release = dep.release.map_or(Value::Null, Value::Bool);
                let range = Value::string_map([
                    ("version_min", Value::from(format_version(dep.version_min))),
                    ("version_max", Value::from(format_version(dep.version_max))),
                    ("release", release),
                ]);
                (Value::from(dep.service.as_str()), range)
            })
            .collect(),
    )
}
