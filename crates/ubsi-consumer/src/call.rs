//! 单次请求的完成状态。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 应答到达、超时清扫、连接失败与本地超时四条路径会竞争同一个请求的结果；
//!   任何一条路径都必须只能“赢一次”，迟到者的结果被静默丢弃。
//!
//! ## 逻辑 (How)
//! - 以 `AtomicBool` 上的 CAS 作为完成闸门，胜者写入 `OnceLock` 结果槽；
//! - 胜者随后依次：逆序执行过滤器 `after`、记录统计、唤醒同步等待者、调用异步回调；
//! - 回调在胜者所在任务上执行，回调 panic 被捕获并记录，不会拖垮读循环或清扫任务。
//!
//! ## 契约 (What)
//! - [`PendingCall::complete`] 返回 `true` 当且仅当本次调用赢得竞争；
//! - [`PendingCall::outcome`] 在完成后始终返回胜者写入的结果。

use crate::filter::{CallSummary, ConsumerFilter, FilterAction, RequestView};
use crate::statistics::Statistics;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use ubsi_core::{ResultCode, ResultError, Value};

/// 异步完成回调。
pub type NotifyFn = Box<dyn FnOnce(ResultCode, Value) + Send + 'static>;

pub(crate) struct PendingCall {
    id: String,
    service: String,
    entry: String,
    started: Instant,
    timeout: Option<Duration>,
    completed: AtomicBool,
    outcome: OnceLock<(ResultCode, Value)>,
    waiter: Mutex<Option<oneshot::Sender<()>>>,
    notify: Mutex<Option<NotifyFn>>,
    filters: Mutex<Vec<Box<dyn ConsumerFilter>>>,
    statistics: Arc<Statistics>,
}

impl PendingCall {
    pub(crate) fn new(
        id: String,
        service: String,
        entry: String,
        timeout: Option<Duration>,
        filters: Vec<Box<dyn ConsumerFilter>>,
        statistics: Arc<Statistics>,
    ) -> Arc<Self> {
        statistics.record_request(&service, &entry);
        Arc::new(Self {
            id,
            service,
            entry,
            started: Instant::now(),
            timeout,
            completed: AtomicBool::new(false),
            outcome: OnceLock::new(),
            waiter: Mutex::new(None),
            notify: Mutex::new(None),
            filters: Mutex::new(filters),
            statistics,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn service(&self) -> &str {
        &self.service
    }

    pub(crate) fn entry(&self) -> &str {
        &self.entry
    }

    /// 注册同步等待者，返回接收端。
    pub(crate) fn wait_handle(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock() = Some(tx);
        rx
    }

    pub(crate) fn set_notify(&self, notify: NotifyFn) {
        *self.notify.lock() = Some(notify);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| now.saturating_duration_since(self.started) > timeout)
    }

    pub(crate) fn outcome(&self) -> Option<&(ResultCode, Value)> {
        self.outcome.get()
    }

    /// 把结果转换为同步调用的返回值。
    pub(crate) fn into_result(&self) -> Result<Value, ResultError> {
        match self.outcome() {
            Some((code, data)) if code.is_ok() => Ok(data.clone()),
            Some((code, data)) => Err(ResultError::new(*code, describe(*code, data))),
            None => Err(ResultError::new(
                ResultCode::REQUEST,
                "request finished without result",
            )),
        }
    }

    /// 依次执行过滤器 `before`，返回首个非放行决定。panic 视为拒绝。
    pub(crate) fn run_before(&self, request: &RequestView<'_>) -> FilterAction {
        let mut filters = self.filters.lock();
        for filter in filters.iter_mut() {
            let action = catch_unwind(AssertUnwindSafe(|| filter.before(request)))
                .unwrap_or_else(|_| {
                    tracing::error!(req_id = %self.id, service = %self.service, entry = %self.entry, "consumer filter before hook panicked");
                    FilterAction::Reject
                });
            if action != FilterAction::Proceed {
                return action;
            }
        }
        FilterAction::Proceed
    }

    pub(crate) fn fail(&self, error: ResultError) -> bool {
        self.complete(error.code, Value::Str(error.message))
    }

    /// 尝试以给定结果完成请求。
    pub(crate) fn complete(&self, code: ResultCode, data: Value) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(req_id = %self.id, code = code.label(), "late completion discarded");
            return false;
        }
        let elapsed = self.started.elapsed();
        let (code, data) = self.outcome.get_or_init(|| (code, data));

        let summary = CallSummary {
            id: &self.id,
            service: &self.service,
            entry: &self.entry,
            code: *code,
            data,
            elapsed,
        };
        let filters = std::mem::take(&mut *self.filters.lock());
        for mut filter in filters.into_iter().rev() {
            if catch_unwind(AssertUnwindSafe(|| filter.after(&summary))).is_err() {
                tracing::error!(req_id = %self.id, service = %self.service, entry = %self.entry, "consumer filter after hook panicked");
            }
        }
        self.statistics
            .record_result(&self.service, &self.entry, &self.id, *code, elapsed);
        if !code.is_ok() {
            tracing::debug!(req_id = %self.id, service = %self.service, entry = %self.entry, code = code.label(), "request failed");
        }

        if let Some(waiter) = self.waiter.lock().take() {
            let _ = waiter.send(());
        }
        if let Some(notify) = self.notify.lock().take() {
            let data = data.clone();
            let code = *code;
            if catch_unwind(AssertUnwindSafe(move || notify(code, data))).is_err() {
                tracing::error!(req_id = %self.id, service = %self.service, entry = %self.entry, "result callback panicked");
            }
        }
        true
    }
}

fn describe(code: ResultCode, data: &Value) -> String {
    match data {
        Value::Str(message) => message.clone(),
        Value::Null => code.label().to_owned(),
        other => format!("{other:?}"),
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("entry", &self.entry)
            .field("completed", &self.is_completed())
            .finish()
    }
}
