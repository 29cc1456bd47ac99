#![doc = r#"
# zss-transport-tcp

## 设计动机（Why）
- **定位**：为 `zss-client` 提供基于 Tokio TCP 的多帧消息传输，同时附带 Broker 侧使用的
  路由监听器，便于在进程内搭建端到端链路。
- **架构角色**：[`TcpTransport`] 实现 [`zss_client::Transport`]，每次调用打开一条独占连接；
  [`TcpRouter`] 按连接握手时声明的身份路由回包。

## 核心契约（What）
- **线上格式**：一条消息为 `u32` 大端帧数，随后每帧为 `u32` 大端长度加原始字节；
  单条消息最多 64 帧，单帧最大 16 MiB，超限视为协议错误；
- **握手**：端点连接成功后先发送仅含自身身份的单帧消息，路由器据此登记对端；
- **身份帧**：路由器收到的消息会在首部补上发送方身份；发送时以首帧为目标身份并将其剥离，
  因此端点收到的回包不含身份帧。

## 实现策略（How）
- 连接建立后通过 `socket2::SockRef` 设置 `SO_LINGER = 0` 与 `TCP_NODELAY`；
- 读半部交给后台任务持续解码并投递到有界通道，写半部由端点直接持有；
- 路由器的接受循环与各连接会话在 `JoinSet` 中运行，路由器析构时统一终止。

## 风险与考量（Trade-offs）
- **linger 0**：关闭时直接发送 RST，未发送完的数据会被丢弃；单次调用模型下回包已收齐，
  该代价可以接受；
- **未知对端**：路由器对未登记身份的发送返回错误，而不是静默丢弃。
"#]

mod channel;
mod frame;
mod listener;
mod util;

pub use channel::{TcpEndpoint, TcpSocketConfig, TcpTransport};
pub use frame::{MAX_FRAME_LEN, MAX_FRAMES, encode, read_message, write_message};
pub use listener::TcpRouter;
