#![doc = r#"
# ubsi-consumer

## 设计目标 (Why)
- 调用端请求引擎：把“按服务名/接口名发起一次调用”转化为路由选择、连接复用、
  应答匹配与超时兜底，并保证每个请求的结果只被确定一次。

## 核心结构 (How)
- [`Consumer`]：运行时对象，持有路由、连接器、过滤器、统计与维护任务；
- [`Request`]：单次请求的构造选项与同步/异步/消息投递/直连四种调用路径；
- [`Router`]：本地路由表 + 注册表快照 + 失败退避的加权随机选择；
- [`ConsumerFilter`]：按请求实例化的前后置拦截器；
- [`MockRegistry`] 与 [`Statistics`]：模拟数据与调用统计。

## 契约 (What)
- 同步调用失败时返回携带结果码的 [`ubsi_core::ResultError`]；
- 异步调用的所有结果都经回调送达，回调在完成竞争的胜者任务上执行；
- 应答与超时竞争时只有一方生效，迟到的一方被静默丢弃。
"#]

mod call;
mod config;
mod connector;
mod consumer;
mod discovery;
mod filter;
mod mock;
mod request;
mod router;
mod statistics;

pub use call::NotifyFn;
pub use config::{ConsumerConfig, LogRule, NodeConfig, RouteConfig};
pub use consumer::Consumer;
pub use filter::{CallSummary, ConsumerFilter, FilterAction, FilterFactory, RequestView};
pub use mock::MockRegistry;
pub use request::Request;
pub use router::{LocalRoute, Resolution, Route, RouteNode, Router, pick_weighted};
pub use statistics::{EntryStatistics, Statistics};
