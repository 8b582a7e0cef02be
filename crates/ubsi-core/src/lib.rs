#![doc = r#"
# ubsi-core

## 定位 (Why)
- UBSI 微服务运行时的共享底座：调用端（consumer）与容器端（container）通过同一份值模型、
  线协议与注册表模型对话，本 crate 只承载这些“双方都必须一致”的部分。

## 模块地图 (How)
- [`value`]：16 种变体的动态值模型与对象 ID；
- [`codec`]：类型标签二进制编解码；[`frame`]：可变长度尺寸头分帧；
- [`envelope`]：请求/应答元组与请求标志位；[`code`]：结果码；
- [`registry`]：容器注册记录、心跳文本与版本约束；
- [`store`]：后端存储契约与进程内实现；[`lock`]：命名互斥；
- [`time`]：可注入墙钟；[`config`]：TOML 配置加载；[`telemetry`]：日志订阅器；
- [`util`]：名称通配、版本号与请求 ID。

## 契约 (What)
- 所有解码路径对任意输入返回 `Result`，从不 panic；
- 线协议常量（类型 ID、标志位、存储键名）视为兼容性承诺，不得随意调整。
"#]

pub mod code;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod lock;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod util;
pub mod value;

pub use code::ResultCode;
pub use codec::{DecodeError, EncodeError, decode, encode};
pub use envelope::{HeaderMap, RequestEnvelope, RequestFlags, ResponseEnvelope};
pub use error::{ResultError, UbsiError};
pub use frame::{Frame, FrameDecoder, frame};
pub use registry::{ContainerRecord, Heartbeat, HeartbeatSignal, VersionRange};
pub use store::{MemoryStore, Store, StoreMessage, Subscription};
pub use time::{Clock, ManualClock, SystemClock};
pub use value::{ObjectId, Value};
