//! 单次请求在容器内的上下文。

use std::net::SocketAddr;
use std::time::Instant;
use ubsi_core::{HeaderMap, RequestFlags, ResultCode, Value};

/// 过滤器、服务钩子与接口实现共享的请求上下文。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 分发流水线的每一步都需要读到同一份请求元数据，并可能写入结果或附加应答尾部；
///   以一个显式上下文对象在各步骤间传递，不依赖线程局部状态。
///
/// ## 契约 (What)
/// - `result()` 为 `None` 表示尚未产生结果；
/// - `set_result` 总是覆盖当前结果，流水线在调用后置钩子后会保护已成功的结果；
/// - `tailer` 非空时随应答一起返回给调用方。
#[derive(Debug)]
pub struct ServiceContext {
    request_id: String,
    service: String,
    entry: String,
    header: HeaderMap,
    flags: RequestFlags,
    peer: SocketAddr,
    container: String,
    started: Instant,
    tailer: HeaderMap,
    result: Option<(ResultCode, Value)>,
}

impl ServiceContext {
    pub(crate) fn new(
        request_id: String,
        service: String,
        entry: String,
        header: HeaderMap,
        flags: RequestFlags,
        peer: SocketAddr,
        container: String,
    ) -> Self {
        Self {
            request_id,
            service,
            entry,
            header,
            flags,
            peer,
            container,
            started: Instant::now(),
            tailer: HeaderMap::new(),
            result: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    pub fn header_value(&self, key: &str) -> Option<&Value> {
        self.header.get(key)
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    /// 发起请求的对端地址。
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 当前容器名（`host#port`）。
    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn set_tailer(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.tailer.insert(key.into(), value.into());
    }

    pub fn tailer(&self) -> &HeaderMap {
        &self.tailer
    }

    pub fn result(&self) -> Option<&(ResultCode, Value)> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, code: ResultCode, data: Value) {
        self.result = Some((code, data));
    }

    pub(crate) fn is_ok(&self) -> bool {
        matches!(self.result, Some((code, _)) if code.is_ok())
    }

    pub(crate) fn take_result(&mut self) -> Option<(ResultCode, Value)> {
        self.result.take()
    }

    pub(crate) fn take_tailer(&mut self) -> Option<HeaderMap> {
        (!self.tailer.is_empty()).then(|| std::mem::take(&mut self.tailer))
    }
}
