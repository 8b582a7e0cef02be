//! 把本地未托管的请求转发给其他容器。
//!
//! 转发路径记录在请求头 [`HEADER_REQ_FORWARD`] 中，以 `;` 分隔经过的容器名；
//! 路径首段为原始调用方地址。当前容器已出现在路径中即判定为环路，立即失败。

use crate::container::ContainerInner;
use crate::context::ServiceContext;
use std::time::Duration;
use tokio::runtime::Handle;
use ubsi_core::registry::HEADER_REQ_FORWARD;
use ubsi_core::{RequestFlags, ResultCode, Value};

/// 在工作线程上同步执行一次转发，结果写入上下文。
pub(crate) fn forward(
    inner: &ContainerInner,
    handle: &Handle,
    ctx: &mut ServiceContext,
    params: Vec<Value>,
    timeout: Duration,
) {
    let me = inner.name();
    let path = match ctx.header_value(HEADER_REQ_FORWARD) {
        Some(Value::Str(path)) if !path.is_empty() => path.clone(),
        _ => ctx.peer().ip().to_string(),
    };
    if path.split(';').any(|hop| hop == me) {
        tracing::warn!(req_id = %ctx.request_id(), service = %ctx.service(), path = %path, "forward loop detected");
        let message = format!("forward loop through {me}: {path}");
        ctx.set_result(ResultCode::FORWARD, Value::from(message));
        return;
    }
    let path = format!("{path};{me}");

    let request = match inner
        .consumer
        .request(ctx.service(), ctx.entry(), params)
    {
        Ok(request) => request,
        Err(err) => {
            ctx.set_result(ResultCode::FORWARD, Value::Str(err.message));
            return;
        }
    };
    let mut request = request
        .timeout(timeout)
        .force_log(ctx.flags().contains(RequestFlags::LOG))
        .hosting_only(true);
    for (key, value) in ctx.header() {
        if key != HEADER_REQ_FORWARD {
            request = request.header(key.clone(), value.clone());
        }
    }
    let request = request.header(HEADER_REQ_FORWARD, path.as_str());

    tracing::debug!(req_id = %ctx.request_id(), forward_id = %request.id(), service = %ctx.service(), path = %path, "request forwarded");
    match handle.block_on(request.call()) {
        Ok(data) => ctx.set_result(ResultCode::OK, data),
        Err(err) if err.code.is_local() => {
            let message = format!("forward failed: {}", err.message);
            ctx.set_result(ResultCode::FORWARD, Value::from(message));
        }
        Err(err) => ctx.set_result(err.code, Value::Str(err.message)),
    }
}
