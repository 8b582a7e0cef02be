//! 调用端过滤器链。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 为所有出站请求提供统一的拦截点：鉴权打点、熔断演练、灰度时替换为模拟数据等。
//!
//! ## 逻辑 (How)
//! - 每次请求按注册顺序通过 [`FilterFactory`] 创建一组新实例，不在请求之间共享可变状态；
//! - `before` 依次执行，首个非 [`FilterAction::Proceed`] 的决定立即生效：
//!   `Reject` 以过滤拒绝结果完成请求，`Mock` 以模拟数据完成请求；
//! - 一旦请求得到结果（包括上述提前完成），全部实例的 `after` 按注册逆序执行一次。
//!
//! ## 契约 (What)
//! - `before` 只读请求视图；`after` 看到的是最终结果码与数据；
//! - `after` 在完成竞争的胜者线程上执行，必须快速返回。

use std::sync::Arc;
use std::time::Duration;
use ubsi_core::{HeaderMap, ResultCode, Value};

/// `before` 的决定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// 继续后续过滤器与真实调用。
    Proceed,
    /// 拒绝本次请求。
    Reject,
    /// 以模拟数据替代真实调用。
    Mock,
}

/// 出站请求的只读视图。
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub id: &'a str,
    pub service: &'a str,
    pub entry: &'a str,
    pub params: &'a [Value],
    pub header: &'a HeaderMap,
}

/// 请求完成后的摘要。
#[derive(Debug, Clone, Copy)]
pub struct CallSummary<'a> {
    pub id: &'a str,
    pub service: &'a str,
    pub entry: &'a str,
    pub code: ResultCode,
    pub data: &'a Value,
    pub elapsed: Duration,
}

/// 单次请求的过滤器实例。
pub trait ConsumerFilter: Send {
    fn before(&mut self, request: &RequestView<'_>) -> FilterAction;

    fn after(&mut self, _summary: &CallSummary<'_>) {}
}

/// 过滤器工厂：每次请求调用一次。
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn ConsumerFilter> + Send + Sync>;
