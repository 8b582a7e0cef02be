#![doc = r#"
# ubsi-container

## 设计目标 (Why)
- 服务端运行时：托管一组按服务名寻址的模块，接受调用端的分帧 TCP 连接，
  在有界工作线程池中执行分发流水线，并把自身状态发布到共享注册表。

## 核心结构 (How)
- [`Container`]：运行时对象，负责启动/停止与模块管理；
- [`ServiceDescriptor`] / [`ModuleLoader`]：服务的静态描述与来源；
- [`ContainerFilter`]：全局前后置拦截器；
- [`ServiceContext`]：单次请求在流水线中共享的上下文；
- [`AccessControl`] 与 [`ContainerStats`]：访问控制与计数器。

## 契约 (What)
- 请求处理路径上的任何失败都以结果码写回调用方，工作线程不会因服务 panic 退出；
- 准入顺序：关闭中 → 过载 → 熔断 → 过滤器 → 服务查找/转发 → 状态 → 接口 → 参数 → 访问控制。
"#]

mod acceptor;
mod acl;
mod admin;
mod config;
mod container;
mod context;
mod dispatch;
mod error;
mod filter;
mod forward;
mod fuse;
mod module;
mod params;
mod publisher;
mod singleton;
mod stats;

#[cfg(test)]
mod testing;

pub use acl::{AccessControl, AclRule};
pub use config::{ACL_READ, ACL_WRITE, AclConfig, ContainerConfig};
pub use container::Container;
pub use context::ServiceContext;
pub use error::ContainerError;
pub use filter::{ContainerFilter, ContainerFilterFactory, FilterDescriptor};
pub use module::{
    ConfigHook, Dependency, EntryDescriptor, InfoHook, LifecycleHook, ModuleLoader, ServiceDescriptor,
    ServiceFactory, ServiceHooks, ServiceInstance, StaticModuleLoader, status_label,
};
pub use params::{ParamDescriptor, ValueShape};
pub use stats::{ContainerCounters, ContainerStats, EntryCounters};
