//! 单次请求：构造选项与四种调用路径。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 同一个请求对象既可同步等待结果，也可异步回调、经通知通道回收或直连指定地址；
//!   四条路径共享过滤器、路由、建连与索引登记流程，只在“如何等待结果”上分叉。
//!
//! ## 逻辑 (How)
//! 1. 发送闸门：请求只能发送一次，重复发送得到 [`ResultCode::REPEAT`]；
//! 2. 创建待决状态（过滤器实例、统计、超时）并执行过滤器 `before`；
//! 3. 路由得到目标节点（或模拟数据），建连失败时标记节点并重新路由一次；
//! 4. 登记到对应索引后写出；`DISCARD` 请求在写出后即以成功完成；
//! 5. 同步路径在本地超时内等待，超时以 [`ResultCode::TIMEOUT`] 完成；异步路径依赖周期清扫。
//!
//! ## 契约 (What)
//! - 同步路径以 `Result<Value, ResultError>` 返回；异步路径的一切结果（含参数与发送错误）都经回调送达；
//! - 异步路径需在 Tokio 运行时内调用。

use crate::call::{NotifyFn, PendingCall};
use crate::connector::{Delivery, Slot, transport_failure};
use crate::consumer::Consumer;
use crate::filter::{FilterAction, RequestView};
use crate::router::Route;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use ubsi_core::registry::{HEADER_REQ_PARAMS, container_name};
use ubsi_core::{
    HeaderMap, RequestEnvelope, RequestFlags, ResultCode, ResultError, Value, VersionRange,
};

#[derive(Debug, Clone)]
enum Target {
    Routed { hosting_only: bool },
    Direct { host: String, port: u16 },
}

/// 一次待发送的请求。
pub struct Request {
    consumer: Consumer,
    id: String,
    service: String,
    entry: String,
    params: Vec<Value>,
    header: HeaderMap,
    version: VersionRange,
    timeout: Option<Duration>,
    connect_alone: bool,
    hosting_only: bool,
    log: bool,
    sent: AtomicBool,
}

impl Request {
    pub(crate) fn new(
        consumer: Consumer,
        id: String,
        service: String,
        entry: String,
        params: Vec<Value>,
    ) -> Self {
        let timeout = consumer.config().request_timeout();
        let log = consumer.config().forces_log(&service, &entry);
        Self {
            consumer,
            id,
            service,
            entry,
            params,
            header: HeaderMap::new(),
            version: VersionRange::ANY,
            timeout,
            connect_alone: false,
            hosting_only: false,
            log,
            sent: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// 按参数名传参，服务端以声明的参数名取值，缺失者取默认值。
    pub fn named_params<K, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let map: BTreeMap<String, Value> = params.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.header
            .insert(HEADER_REQ_PARAMS.to_owned(), Value::string_map(map));
        self
    }

    /// 版本约束，`0` 表示不限；`release` 为 `None` 时不区分发布版与测试版。
    pub fn version(mut self, min: u32, max: u32, release: Option<bool>) -> Self {
        self.version = VersionRange { min, max, release };
        self
    }

    /// 覆盖默认请求超时；`Duration::ZERO` 表示不限。
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// 使用独占连接，请求结束后即关闭。
    pub fn connect_alone(mut self, alone: bool) -> Self {
        self.connect_alone = alone;
        self
    }

    /// 只路由到真正托管服务的容器，不经过转发门。
    pub fn hosting_only(mut self, hosting_only: bool) -> Self {
        self.hosting_only = hosting_only;
        self
    }

    /// 要求服务端记录访问日志。
    pub fn force_log(mut self, log: bool) -> Self {
        self.log = self.log || log;
        self
    }

    fn envelope(&self, delivery: Delivery) -> RequestEnvelope {
        let mut flags = RequestFlags::empty();
        match delivery {
            Delivery::Reply => {}
            Delivery::Discard => flags.insert(RequestFlags::DISCARD),
            Delivery::Message => flags.insert(RequestFlags::MESSAGE),
        }
        if self.log {
            flags.insert(RequestFlags::LOG);
        }
        RequestEnvelope {
            id: self.id.clone(),
            header: self.header.clone(),
            service: self.service.clone(),
            entry: self.entry.clone(),
            params: self.params.clone(),
            flags,
        }
    }

    fn routed(&self) -> Target {
        Target::Routed {
            hosting_only: self.hosting_only,
        }
    }

    fn begin(&self) -> Result<(), ResultError> {
        if self.sent.swap(true, Ordering::AcqRel) {
            return Err(ResultError::new(
                ResultCode::REPEAT,
                format!("request {} already sent", self.id),
            ));
        }
        Ok(())
    }

    fn pending(&self) -> Arc<PendingCall> {
        PendingCall::new(
            self.id.clone(),
            self.service.clone(),
            self.entry.clone(),
            self.timeout,
            self.consumer.instantiate_filters(),
            Arc::clone(self.consumer.statistics()),
        )
    }

    /// 同步调用：路由、发送并等待结果。
    pub async fn call(&self) -> Result<Value, ResultError> {
        self.call_to(self.routed()).await
    }

    /// 绕过路由，经独占连接直连指定地址。
    pub async fn direct(&self, host: &str, port: u16) -> Result<Value, ResultError> {
        self.call_to(Target::Direct {
            host: host.to_owned(),
            port,
        })
        .await
    }

    async fn call_to(&self, target: Target) -> Result<Value, ResultError> {
        self.begin()?;
        let call = self.pending();
        let done = call.wait_handle();
        let envelope = self.envelope(Delivery::Reply);
        let slot = dispatch(
            &self.consumer,
            &envelope,
            &self.version,
            self.connect_alone,
            &target,
            &call,
            Delivery::Reply,
        )
        .await;

        if !call.is_completed() {
            match self.timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, done).await.is_err() {
                        call.complete(ResultCode::TIMEOUT, Value::from("request timeout"));
                    }
                }
                None => {
                    let _ = done.await;
                }
            }
        }
        self.consumer.connector().release(&slot, &self.id);
        call.into_result()
    }

    /// 异步调用：结果经 `notify` 送达。
    ///
    /// `via_message` 为真时应答经通知通道回收，需配置后端存储，否则以
    /// [`ResultCode::MESSAGE`] 完成。
    pub fn call_async<F>(&self, notify: F, via_message: bool)
    where
        F: FnOnce(ResultCode, Value) + Send + 'static,
    {
        let delivery = if via_message {
            Delivery::Message
        } else {
            Delivery::Reply
        };
        self.spawn(self.routed(), delivery, Some(Box::new(notify)));
    }

    /// 发送但不需要应答。
    pub fn post(&self) {
        self.spawn(self.routed(), Delivery::Discard, None);
    }

    /// [`Request::direct`] 的异步版本。
    pub fn direct_async<F>(&self, host: &str, port: u16, notify: F)
    where
        F: FnOnce(ResultCode, Value) + Send + 'static,
    {
        let target = Target::Direct {
            host: host.to_owned(),
            port,
        };
        self.spawn(target, Delivery::Reply, Some(Box::new(notify)));
    }

    fn spawn(&self, target: Target, delivery: Delivery, notify: Option<NotifyFn>) {
        if let Err(err) = self.begin() {
            if let Some(notify) = notify {
                notify(err.code, Value::Str(err.message));
            }
            return;
        }
        let call = self.pending();
        if let Some(notify) = notify {
            call.set_notify(notify);
        }
        if delivery == Delivery::Message && !self.consumer.message_ready() {
            call.fail(ResultError::new(
                ResultCode::MESSAGE,
                "message channel unavailable",
            ));
            return;
        }
        let consumer = self.consumer.clone();
        let envelope = self.envelope(delivery);
        let version = self.version;
        let alone = self.connect_alone;
        tokio::spawn(async move {
            dispatch(&consumer, &envelope, &version, alone, &target, &call, delivery).await;
        });
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("entry", &self.entry)
            .field("params", &self.params.len())
            .field("timeout", &self.timeout)
            .field("connect_alone", &self.connect_alone)
            .finish()
    }
}

/// 过滤、路由、建连、登记并写出。返回请求所在的索引槽位。
async fn dispatch(
    consumer: &Consumer,
    envelope: &RequestEnvelope,
    version: &VersionRange,
    connect_alone: bool,
    target: &Target,
    call: &Arc<PendingCall>,
    delivery: Delivery,
) -> crate::connector::Slot {
    let view = RequestView {
        id: &envelope.id,
        service: &envelope.service,
        entry: &envelope.entry,
        params: &envelope.params,
        header: &envelope.header,
    };
    match call.run_before(&view) {
        FilterAction::Proceed => {}
        FilterAction::Reject => {
            call.fail(ResultError::new(ResultCode::FILTER, "request rejected by filter"));
            return Slot::None;
        }
        FilterAction::Mock => {
            match consumer.mocks().lookup(&envelope.service, &envelope.entry) {
                Ok(data) => call.complete(ResultCode::OK, data),
                Err(err) => call.fail(err),
            };
            return Slot::None;
        }
    }

    let frame = match envelope.to_frame() {
        Ok(frame) => frame,
        Err(err) => {
            call.fail(ResultError::new(ResultCode::REQUEST, err.to_string()));
            return Slot::None;
        }
    };
    // 消息投递的应答不经原连接返回，没有必要独占连接
    let alone = connect_alone && delivery != Delivery::Message;
    let connector = consumer.connector();

    let link = match target {
        Target::Direct { host, port } => match connector.connect(host, *port, true).await {
            Ok(link) => link,
            Err(err) => {
                call.fail(transport_failure(&err));
                return Slot::None;
            }
        },
        Target::Routed { hosting_only } => {
            let router = consumer.router();
            let mut attempt = 0;
            loop {
                attempt += 1;
                let route = if *hosting_only {
                    router.get_hosting_server(&envelope.service, &envelope.entry, version)
                } else {
                    router.get_server(&envelope.service, &envelope.entry, version)
                };
                let node = match route {
                    Ok(Route::Node(node)) => node,
                    Ok(Route::Mock(data)) => {
                        call.complete(ResultCode::OK, data);
                        return Slot::None;
                    }
                    Err(err) => {
                        call.fail(err);
                        return Slot::None;
                    }
                };
                let name = container_name(&node.host, node.port);
                match connector.connect(&node.host, node.port, alone).await {
                    Ok(link) => {
                        router.mark_connected(&name);
                        break link;
                    }
                    Err(err) => {
                        let failure = transport_failure(&err);
                        if failure.code == ResultCode::CONNECT {
                            router.mark_failed(&name);
                            if attempt < 2 {
                                continue;
                            }
                        }
                        call.fail(failure);
                        return Slot::None;
                    }
                }
            }
        }
    };

    if envelope.flags.contains(RequestFlags::LOG) {
        tracing::info!(req_id = %envelope.id, service = %envelope.service, entry = %envelope.entry, "request sent");
    }
    match connector.transmit(link, call, frame, delivery) {
        Ok(slot) => {
            if delivery == Delivery::Discard {
                call.complete(ResultCode::OK, Value::Null);
            }
            slot
        }
        Err(err) => {
            call.fail(transport_failure(&err));
            Slot::None
        }
    }
}
