#![doc = r#"
# zss-client

## 设计动机（Why）
- **定位**：经由 Broker 转发的单次请求/响应 RPC 客户端。调用方只需给出动词与负载，
  客户端负责寻址、关联、截止时间、结果归类与跨调用链的追踪时间戳传播。
- **架构角色**：本 crate 只依赖抽象的 [`Transport`](transport::Transport)，
  具体套接字实现由 `zss-transport-tcp` 等 crate 提供。
- **设计理念**：错误目录、配置与时钟均为构造期注入的值对象，不存在进程级可变状态；
  每次调用的结算在类型层面只发生一次。

## 核心契约（What）
- [`ZssClient::call`] 返回 `Result<Reply, ErrorDescriptor>`：
  成功为 `[200, 300)` 响应；应用错误透传上游描述或取自目录；传输错误折叠为 500；
  截止时间到期为保留码 599；
- 每次调用使用 `<identity>#<uuid>` 身份打开独占端点，结束时恰好关闭一次；
- 嵌套调用通过 `micro-metrics-stack` 头部保存祖先的追踪时间戳，内层结束后原样恢复。

## 实现策略（How）
- [`envelope`]：信封模型与八帧编解码；
- [`error`]：错误描述、错误目录与响应归类；
- [`metric`]：追踪头部栈的纯函数变换与指标下沉端；
- [`config`]：实例配置（支持 TOML）与单次调用选项；
- [`transport`]：端点与传输工厂 trait；
- [`client`]：调用编排器与门面；
- `test_stubs`（`test-util` feature）：脚本化传输、记录型下沉端与手动时钟。

## 风险与考量（Trade-offs）
- **时间基准**：追踪时间戳使用墙钟毫秒，跨主机比较受时钟漂移影响；
  截止时间使用 Tokio 单调时钟，两者互不干扰。
- **非目标**：连接复用、重试退避、服务发现、压缩与认证均不在本 crate 范围内，
  重试策略由调用方自行决定。
"#]

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metric;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_stubs;

pub use client::{Reply, ZssClient, ZssClientBuilder};
pub use config::{CallOptions, ClientConfig, ConfigError};
pub use envelope::{Address, Envelope, EnvelopeError, Frames, Headers, MessageType};
pub use error::{CatalogError, ErrorCatalog, ErrorDescriptor};
pub use metric::{Clock, Measurement, MetricSink, SystemClock, TraceStamper, TracingMetricSink};
pub use transport::{Endpoint, EndpointEvent, Operation, Transport, TransportError};
