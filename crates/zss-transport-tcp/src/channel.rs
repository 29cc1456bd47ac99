use crate::{frame, util::resolve};
use async_trait::async_trait;
use bytes::Bytes;
use socket2::SockRef;
use std::{io, time::Duration};
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
};
use zss_client::{Endpoint, EndpointEvent, Frames, Operation, Transport, TransportError};

/// 入站事件通道容量。单次调用通常只等待一条回包，少量缓冲足以吸收错配消息。
const INBOUND_CAPACITY: usize = 16;

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 端点为单次调用独占，调用结束即关闭；`SO_LINGER = 0` 让关闭立即释放内核资源，
///   不在 `TIME_WAIT` 中堆积大量短连接；
/// - 请求通常是一条小消息，`TCP_NODELAY` 避免 Nagle 算法引入额外延迟。
///
/// ## 契约（What）
/// - 缺省值为 `linger = Some(0)`、`nodelay = true`；
/// - `linger = None` 表示沿用内核默认策略；
/// - **前置条件**：调用 `apply` 前 `TcpStream` 必须已成功创建；
/// - **后置条件**：`apply` 返回 `Ok(())` 时两项选项均已落地。
///
/// ## 注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上按秒取整；零值始终表示关闭时发送 RST。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            linger: Some(Duration::ZERO),
            nodelay: true,
        }
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)
    }
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 为每次调用创建独占 TCP 端点的传输工厂。
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    config: TcpSocketConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }
}

impl Transport for TcpTransport {
    fn open(&self, identity: &str) -> Result<Box<dyn Endpoint>, TransportError> {
        Ok(Box::new(TcpEndpoint::new(identity, self.config.clone())))
    }
}

/// 单次调用独占的 TCP 端点。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - `connect`：解析地址、建连、应用套接字配置，随后发送身份握手帧；
///   读半部交给后台任务，写半部留在端点内；
/// - 后台任务把解码后的消息或错误投递到有界通道，`next_event` 从通道读取；
/// - 对端关闭连接时投递一次 [`TransportError::Closed`]，随后任务结束。
///
/// ## 契约 (What)
/// - `connect` 只能成功一次，重复调用返回协议错误；
/// - `close` 幂等：终止后台任务并释放写半部，之后的 `send` 与 `next_event` 均返回 `Closed`；
/// - 析构时自动执行 `close`。
#[derive(Debug)]
pub struct TcpEndpoint {
    identity: String,
    config: TcpSocketConfig,
    writer: Option<OwnedWriteHalf>,
    inbound: Option<mpsc::Receiver<EndpointEvent>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl TcpEndpoint {
    pub fn new(identity: impl Into<String>, config: TcpSocketConfig) -> Self {
        Self {
            identity: identity.into(),
            config,
            writer: None,
            inbound: None,
            reader: None,
            closed: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.writer.is_some() {
            return Err(TransportError::Protocol(format!(
                "endpoint `{}` is already connected",
                self.identity
            )));
        }

        let addr = resolve(address).await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| TransportError::io(Operation::CONNECT, err))?;
        self.config
            .apply(&stream)
            .map_err(|err| TransportError::io(Operation::CONFIGURE, err))?;

        let (read, mut write) = stream.into_split();
        frame::write_message(&mut write, &[Bytes::from(self.identity.clone())]).await?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        self.reader = Some(tokio::spawn(read_loop(read, tx)));
        self.inbound = Some(rx);
        self.writer = Some(write);
        tracing::debug!(identity = %self.identity, %addr, "endpoint connected");
        Ok(())
    }

    async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        frame::write_message(writer, &frames).await
    }

    async fn next_event(&mut self) -> EndpointEvent {
        match self.inbound.as_mut() {
            Some(inbound) => inbound
                .recv()
                .await
                .unwrap_or(EndpointEvent::Error(TransportError::Closed)),
            None => EndpointEvent::Error(TransportError::Closed),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound = None;
        self.writer = None;
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(read: OwnedReadHalf, tx: mpsc::Sender<EndpointEvent>) {
    let mut read = BufReader::new(read);
    loop {
        let (event, last) = match frame::read_message(&mut read).await {
            Ok(Some(frames)) => (EndpointEvent::Message(frames), false),
            Ok(None) => (EndpointEvent::Error(TransportError::Closed), true),
            Err(err) => {
                tracing::debug!(code = err.code(), error = %err, "endpoint read failed");
                (EndpointEvent::Error(err), true)
            }
        };
        if tx.send(event).await.is_err() || last {
            break;
        }
    }
}
