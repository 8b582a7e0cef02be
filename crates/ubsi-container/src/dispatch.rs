//! 准入控制与分发流水线。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 网络线程只做解码与准入判定，服务逻辑全部在有界工作线程池中执行，
//!   慢服务不会阻塞连接读写；
//! - 流水线中的任何失败（含 panic）都转换为结果码写回调用方，绝不让工作线程退出。
//!
//! ## 逻辑 (How)
//! 1. 准入：关闭中返回 [`ResultCode::SHUTDOWN`]；等待数达到过载阈值返回 [`ResultCode::OVERLOAD`]；
//! 2. 熔断：同一接口已超时的在途调用数达到阈值时返回 [`ResultCode::BREAK`]；
//! 3. 全局过滤器 `before`（跳过非运行状态的过滤器），任一失败即中止；
//! 4. 本地未托管的服务：开启转发时转发，否则 [`ResultCode::NOSERVICE`]；
//! 5. 状态、接口、参数对齐与访问控制检查；
//! 6. 服务 `before` → 接口 → 服务 `after`，`after` 总会执行；
//! 7. 已执行过 `before` 的过滤器按逆序执行 `after`，每个 `after` 重新登记为在途步骤；
//! 8. 按请求标志写回原连接、经通知通道投递或丢弃。
//!
//! ## 契约 (What)
//! - 服务 `after` 钩子只能在尚无成功结果时改写结果；
//! - 应用错误沿用其结果码，若误用成功码则改为 [`ResultCode::ERROR`]。

use crate::container::ContainerInner;
use crate::context::ServiceContext;
use crate::error::ContainerError;
use crate::filter::ActiveFilter;
use crate::forward;
use crate::fuse;
use crate::module::{EntryDescriptor, HostedService, panic_message, status_label};
use crate::params::reconcile;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use ubsi_core::registry::{NOTIFY_CHANNEL, STATUS_RUNNING};
use ubsi_core::{
    RequestEnvelope, RequestFlags, ResponseEnvelope, ResultCode, StoreMessage, UbsiError, Value,
};
use ubsi_transport_tcp::TcpChannel;

/// 应答的写出目标。
pub(crate) trait ReplySink: Send + Sync {
    fn reply(&self, response: &ResponseEnvelope) -> Result<(), ContainerError>;
}

impl ReplySink for TcpChannel {
    fn reply(&self, response: &ResponseEnvelope) -> Result<(), ContainerError> {
        let frame = response.to_frame().map_err(UbsiError::from)?;
        self.send(frame)?;
        Ok(())
    }
}

/// 准入判定；受理的请求交给工作线程池。
pub(crate) async fn admit(
    inner: &Arc<ContainerInner>,
    request: RequestEnvelope,
    peer: SocketAddr,
    sink: Arc<dyn ReplySink>,
) {
    if inner.shutting_down.load(Ordering::Acquire) {
        let response = ResponseEnvelope::new(
            request.id,
            ResultCode::SHUTDOWN,
            Value::from("container is shutting down"),
        );
        deliver(inner, request.flags, response, sink.as_ref()).await;
        return;
    }
    if inner.stats.waiting() >= u64::from(inner.config.overload) {
        inner.stats.overloaded();
        tracing::warn!(req_id = %request.id, service = %request.service, waiting = inner.stats.waiting(), "request rejected by overload");
        let response = ResponseEnvelope::new(
            request.id,
            ResultCode::OVERLOAD,
            Value::from("container overloaded"),
        );
        deliver(inner, request.flags, response, sink.as_ref()).await;
        return;
    }
    inner.stats.accepted();

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let id = request.id.clone();
        let flags = request.flags;
        let Ok(permit) = Arc::clone(&inner.workers).acquire_owned().await else {
            inner.stats.dealt(false);
            return;
        };
        let handle = Handle::current();
        let worker = Arc::clone(&inner);
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            execute(&worker, &handle, request, peer)
        })
        .await;
        let response = match joined {
            Ok((response, over)) => {
                inner.stats.dealt(over);
                response
            }
            Err(err) => {
                inner.stats.dealt(false);
                inner.dealing.leave(&id);
                tracing::error!(req_id = %id, error = %err, "worker task failed");
                ResponseEnvelope::new(id, ResultCode::EXCEPTION, Value::from("worker failed"))
            }
        };
        deliver(&inner, flags, response, sink.as_ref()).await;
    });
}

/// 按请求标志写出应答。
pub(crate) async fn deliver(
    inner: &ContainerInner,
    flags: RequestFlags,
    response: ResponseEnvelope,
    sink: &dyn ReplySink,
) {
    if flags.contains(RequestFlags::DISCARD) {
        return;
    }
    if flags.contains(RequestFlags::MESSAGE) {
        match &inner.store {
            Some(store) => {
                let published = match response.encode() {
                    Ok(bytes) => store
                        .publish(NOTIFY_CHANNEL, StoreMessage::Binary(bytes))
                        .await
                        .map_err(|err| err.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                if let Err(err) = published {
                    tracing::warn!(req_id = %response.id, error = %err, "message delivery failed");
                }
                return;
            }
            None => {
                tracing::warn!(req_id = %response.id, "message delivery without backing store, replying on socket");
            }
        }
    }
    if let Err(err) = sink.reply(&response) {
        tracing::debug!(req_id = %response.id, error = %err, "reply dropped");
    }
}

/// 在工作线程上执行完整流水线，返回应答与是否超过接口超时。
pub(crate) fn execute(
    inner: &ContainerInner,
    handle: &Handle,
    request: RequestEnvelope,
    peer: SocketAddr,
) -> (ResponseEnvelope, bool) {
    let RequestEnvelope {
        id,
        header,
        service,
        entry,
        params,
        flags,
    } = request;
    let log = flags.contains(RequestFlags::LOG);
    if log {
        tracing::info!(req_id = %id, service = %service, entry = %entry, peer = %peer, "request enter");
    }
    let mut ctx = ServiceContext::new(id, service, entry, header, flags, peer, inner.name());
    let timeout = pipeline(inner, handle, &mut ctx, params);
    inner.dealing.leave(ctx.request_id());

    let elapsed = ctx.started().elapsed();
    let (code, data) = ctx.take_result().unwrap_or((ResultCode::OK, Value::Null));
    if log {
        tracing::info!(req_id = %ctx.request_id(), code = %code, elapsed_ms = elapsed.as_millis() as u64, "request leave");
    }
    let over = timeout.is_some_and(|limit| elapsed > limit);
    let mut response = ResponseEnvelope::new(ctx.request_id(), code, data);
    response.tailer = ctx.take_tailer();
    (response, over)
}

fn pipeline(
    inner: &ContainerInner,
    handle: &Handle,
    ctx: &mut ServiceContext,
    params: Vec<Value>,
) -> Option<Duration> {
    let hosted = inner
        .services
        .get(ctx.service())
        .map(|entry| Arc::clone(entry.value()));

    if hosted
        .as_ref()
        .is_some_and(|s| s.descriptor().find_entry(ctx.entry()).is_some())
    {
        let overdue = inner
            .dealing
            .overdue(ctx.service(), ctx.entry(), Instant::now());
        if fuse::tripped(inner.config.fuse, overdue) {
            tracing::warn!(req_id = %ctx.request_id(), service = %ctx.service(), entry = %ctx.entry(), overdue, "fuse tripped");
            let message = format!("{} calls of {}.{} overdue", overdue, ctx.service(), ctx.entry());
            ctx.set_result(ResultCode::BREAK, Value::from(message));
            return None;
        }
    }

    let mut filters: Vec<ActiveFilter> = inner
        .filters
        .read()
        .iter()
        .filter(|f| f.is_running())
        .filter_map(|f| ActiveFilter::instantiate(f))
        .collect();
    let mut entered = 0;
    for filter in filters.iter_mut() {
        inner
            .dealing
            .enter(ctx.request_id(), &filter.class_name, "", filter.timeout);
        entered += 1;
        if let Err(err) = filter.before(ctx) {
            tracing::debug!(req_id = %ctx.request_id(), filter = %filter.class_name, code = %err.code, "request stopped by filter");
            ctx.set_result(failure_code(err.code), Value::Str(err.message));
            break;
        }
    }

    let mut timeout = None;
    if ctx.result().is_none() {
        timeout = serve(inner, handle, ctx, hosted.as_deref(), params);
    }
    for filter in filters[..entered].iter_mut().rev() {
        inner
            .dealing
            .enter(ctx.request_id(), &filter.class_name, "", filter.timeout);
        filter.after(ctx);
    }
    timeout
}

fn serve(
    inner: &ContainerInner,
    handle: &Handle,
    ctx: &mut ServiceContext,
    hosted: Option<&HostedService>,
    params: Vec<Value>,
) -> Option<Duration> {
    let Some(service) = hosted else {
        match inner.config.forward_timeout() {
            Some(timeout) => {
                inner.stats.forwarded();
                forward::forward(inner, handle, ctx, params, timeout);
            }
            None => {
                let message = format!("service `{}` not found", ctx.service());
                ctx.set_result(ResultCode::NOSERVICE, Value::from(message));
            }
        }
        return None;
    };
    let status = service.status();
    if status != STATUS_RUNNING {
        let message = format!("service `{}` is {}", ctx.service(), status_label(status));
        ctx.set_result(ResultCode::STOP, Value::from(message));
        return None;
    }
    let descriptor = service.descriptor();
    let Some(entry) = descriptor.find_entry(ctx.entry()) else {
        let message = format!("entry `{}.{}` not found", ctx.service(), ctx.entry());
        ctx.set_result(ResultCode::NOENTRY, Value::from(message));
        return None;
    };
    let params = match reconcile(&entry.params, params, ctx.header()) {
        Ok(params) => params,
        Err(err) => {
            ctx.set_result(err.code, Value::Str(err.message));
            return None;
        }
    };
    if !inner
        .acl
        .permits(ctx.service(), &ctx.peer().ip(), entry.readonly)
    {
        let message = format!("access to `{}` denied for {}", ctx.service(), ctx.peer().ip());
        ctx.set_result(ResultCode::REJECT, Value::from(message));
        return None;
    }

    let timeout = descriptor.entry_timeout(entry);
    inner
        .dealing
        .enter(ctx.request_id(), ctx.service(), ctx.entry(), timeout);
    service.count_deal();
    invoke(service, entry, ctx, params);
    inner
        .stats
        .record_entry(ctx.service(), ctx.entry(), ctx.is_ok(), ctx.started().elapsed());
    Some(timeout)
}

fn invoke(
    service: &HostedService,
    entry: &EntryDescriptor,
    ctx: &mut ServiceContext,
    params: Vec<Value>,
) {
    let mut instance = match catch_unwind(AssertUnwindSafe(|| service.descriptor().instantiate()))
    {
        Ok(instance) => instance,
        Err(panic) => {
            raise(ctx, "instantiate", panic_message(panic.as_ref()));
            return;
        }
    };

    let body = catch_unwind(AssertUnwindSafe(|| {
        instance.before(ctx)?;
        instance.invoke(&entry.name, ctx, params)
    }));
    match body {
        Ok(Ok(data)) => ctx.set_result(ResultCode::OK, data),
        Ok(Err(err)) => ctx.set_result(failure_code(err.code), Value::Str(err.message)),
        Err(panic) => raise(ctx, "invoke", panic_message(panic.as_ref())),
    }

    let settled = if ctx.is_ok() {
        ctx.result().cloned()
    } else {
        None
    };
    match catch_unwind(AssertUnwindSafe(|| instance.after(ctx))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) if settled.is_none() => {
            ctx.set_result(failure_code(err.code), Value::Str(err.message));
        }
        Ok(Err(err)) => {
            tracing::warn!(req_id = %ctx.request_id(), service = %ctx.service(), error = %err, "after hook failed after success");
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            if settled.is_none() {
                raise(ctx, "after", message);
            } else {
                tracing::error!(req_id = %ctx.request_id(), service = %ctx.service(), entry = %ctx.entry(), phase = "after", panic = %message, "service panicked");
            }
        }
    }
    if let Some((code, data)) = settled {
        ctx.set_result(code, data);
    }
}

fn raise(ctx: &mut ServiceContext, phase: &'static str, message: String) {
    tracing::error!(req_id = %ctx.request_id(), service = %ctx.service(), entry = %ctx.entry(), phase, panic = %message, "service panicked");
    ctx.set_result(ResultCode::EXCEPTION, Value::Str(message));
}

fn failure_code(code: ResultCode) -> ResultCode {
    if code.is_ok() { ResultCode::ERROR } else { code }
}
