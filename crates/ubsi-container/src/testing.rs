//! 单元测试共用的服务与过滤器替身。

use crate::context::ServiceContext;
use crate::dispatch::ReplySink;
use crate::error::ContainerError;
use crate::filter::ContainerFilter;
use crate::module::{EntryDescriptor, ServiceDescriptor, ServiceInstance};
use crate::params::{ParamDescriptor, ValueShape};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use ubsi_core::{ResponseEnvelope, ResultCode, ResultError, Value};

/// `echo` 原样返回首个参数；`add` 求和；`fail`/`panic`/`sleep` 用于异常路径。
pub(crate) struct EchoService;

impl ServiceInstance for EchoService {
    fn invoke(
        &mut self,
        entry: &str,
        ctx: &mut ServiceContext,
        params: Vec<Value>,
    ) -> Result<Value, ResultError> {
        match entry {
            "echo" => Ok(params.into_iter().next().unwrap_or(Value::Null)),
            "add" => {
                let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
                Ok(Value::Long(sum))
            }
            "fail" => Err(ResultError::new(ResultCode::new(101), "bad input")),
            "panic" => panic!("echo exploded"),
            "sleep" => {
                let ms = params.first().and_then(Value::as_i64).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms as u64));
                Ok(Value::Null)
            }
            "tail" => {
                ctx.set_tailer("served-by", ctx.container().to_owned());
                Ok(Value::Bool(true))
            }
            other => Err(ResultError::new(ResultCode::NOENTRY, other)),
        }
    }
}

pub(crate) fn echo_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("echo", || Box::new(EchoService) as Box<dyn ServiceInstance>)
        .class_name("demo.Echo")
        .timeout(Duration::from_millis(50))
        .entry(
            EntryDescriptor::new("echo")
                .readonly(true)
                .param(ParamDescriptor::new("text", ValueShape::Any)),
        )
        .entry(
            EntryDescriptor::new("add")
                .param(ParamDescriptor::new("a", ValueShape::Long))
                .param(ParamDescriptor::new("b", ValueShape::Long).default_literal("1")),
        )
        .entry(EntryDescriptor::new("fail"))
        .entry(EntryDescriptor::new("panic"))
        .entry(EntryDescriptor::new("sleep").param(ParamDescriptor::new("ms", ValueShape::Long)))
        .entry(EntryDescriptor::new("tail"))
}

pub(crate) struct NoopFilter;

impl ContainerFilter for NoopFilter {}

/// 把前后置调用顺序写入共享日志；`reject` 为真时在前置阶段拒绝。
pub(crate) struct RecordingFilter {
    pub(crate) name: &'static str,
    pub(crate) journal: Arc<Mutex<Vec<String>>>,
    pub(crate) reject: bool,
}

impl ContainerFilter for RecordingFilter {
    fn before(&mut self, _ctx: &mut ServiceContext) -> Result<(), ResultError> {
        self.journal.lock().push(format!("{}.before", self.name));
        if self.reject {
            return Err(ResultError::new(ResultCode::REJECT, "blocked by filter"));
        }
        Ok(())
    }

    fn after(&mut self, _ctx: &mut ServiceContext) {
        self.journal.lock().push(format!("{}.after", self.name));
    }
}

/// 收集写出的应答。
#[derive(Default)]
pub(crate) struct CaptureSink {
    pub(crate) replies: Mutex<Vec<ResponseEnvelope>>,
}

impl ReplySink for CaptureSink {
    fn reply(&self, response: &ResponseEnvelope) -> Result<(), ContainerError> {
        self.replies.lock().push(response.clone());
        Ok(())
    }
}
