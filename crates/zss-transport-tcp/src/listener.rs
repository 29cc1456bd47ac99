use crate::{TcpSocketConfig, frame, util};
use bytes::Bytes;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, mpsc},
    task::{JoinHandle, JoinSet},
};
use zss_client::{Frames, Operation, TransportError};

const INBOUND_CAPACITY: usize = 256;

type Peers = Arc<Mutex<HashMap<String, OwnedWriteHalf>>>;

/// 按身份路由的 TCP 监听器，供 Broker 与集成测试使用。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 端点只认识 Broker 地址，回包必须由 Broker 按请求方身份送回对应连接；
///   路由器在连接握手时登记“身份 → 写半部”映射，实现这一点。
///
/// ## 逻辑 (How)
/// - `bind` 后台运行接受循环，每条连接一个会话任务，统一放入 `JoinSet`；
/// - 会话先读取单帧握手消息作为对端身份，之后的每条消息在首部补上身份后投递给 `recv`；
/// - 连接断开时会话移除自己的登记项。
///
/// ## 契约 (What)
/// - `recv`：返回下一条入站消息，首帧为发送方身份；路由器关闭后返回 `None`；
/// - `send`：首帧为目标身份，剥离后把剩余帧写给该对端；身份未登记时返回协议错误；
/// - 析构时终止接受循环与全部会话。
///
/// ## 注意事项 (Trade-offs)
/// - 所有对端的写半部共用一把异步锁，向慢对端写入会阻塞其他回包；
///   作为测试与轻量 Broker 足够，高并发场景应拆分为每对端独立的写队列。
pub struct TcpRouter {
    local_addr: SocketAddr,
    peers: Peers,
    inbound: mpsc::Receiver<Frames>,
    acceptor: JoinHandle<()>,
}

impl TcpRouter {
    /// 绑定 `tcp://host:port` 地址，端口为 0 时由系统分配。
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        Self::bind_with_config(address, TcpSocketConfig::default()).await
    }

    pub async fn bind_with_config(
        address: &str,
        config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let addr = util::resolve(address).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::io(Operation::BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| TransportError::io(Operation::BIND, err))?;

        let peers = Peers::default();
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let acceptor = tokio::spawn(accept_loop(listener, config, peers.clone(), tx));
        tracing::debug!(%local_addr, "router listening");

        Ok(Self {
            local_addr,
            peers,
            inbound,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 供端点连接的地址串。
    pub fn endpoint(&self) -> String {
        util::to_uri(self.local_addr)
    }

    /// 当前已完成握手的对端数量。
    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn recv(&mut self) -> Option<Frames> {
        self.inbound.recv().await
    }

    pub async fn send(&self, mut frames: Frames) -> Result<(), TransportError> {
        if frames.len() < 2 {
            return Err(TransportError::Protocol(
                "routed message needs an identity frame and a body".into(),
            ));
        }
        let target = frames.remove(0);
        let identity = String::from_utf8_lossy(&target);

        let mut peers = self.peers.lock().await;
        let writer = peers
            .get_mut(identity.as_ref())
            .ok_or_else(|| TransportError::Protocol(format!("unknown peer `{identity}`")))?;
        frame::write_message(writer, &frames).await
    }
}

impl Drop for TcpRouter {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl std::fmt::Debug for TcpRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpRouter")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: TcpSocketConfig,
    peers: Peers,
    tx: mpsc::Sender<Frames>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = config.apply(&stream) {
                        let err = TransportError::io(Operation::CONFIGURE, err);
                        tracing::warn!(code = err.code(), %peer, error = %err, "dropping connection");
                        continue;
                    }
                    sessions.spawn(session(stream, peer, peers.clone(), tx.clone()));
                }
                Err(err) => {
                    let err = TransportError::io(Operation::ACCEPT, err);
                    tracing::warn!(code = err.code(), error = %err, "accept failed");
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

async fn session(stream: TcpStream, peer: SocketAddr, peers: Peers, tx: mpsc::Sender<Frames>) {
    let (read, write) = stream.into_split();
    let mut read = BufReader::new(read);

    let identity = match frame::read_message(&mut read).await {
        Ok(Some(mut frames)) if frames.len() == 1 => {
            String::from_utf8_lossy(&frames.remove(0)).into_owned()
        }
        Ok(_) => {
            tracing::debug!(%peer, "connection closed without a valid handshake");
            return;
        }
        Err(err) => {
            tracing::debug!(code = err.code(), %peer, error = %err, "handshake failed");
            return;
        }
    };
    peers.lock().await.insert(identity.clone(), write);

    let prefix = Bytes::from(identity.clone());
    loop {
        match frame::read_message(&mut read).await {
            Ok(Some(mut frames)) => {
                frames.insert(0, prefix.clone());
                if tx.send(frames).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(code = err.code(), %peer, %identity, error = %err, "session ended");
                break;
            }
        }
    }
    peers.lock().await.remove(&identity);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_unknown_peer_is_rejected() {
        let router = TcpRouter::bind("tcp://127.0.0.1:0").await.unwrap();
        let err = router
            .send(vec![Bytes::from_static(b"ghost#1"), Bytes::from_static(b"body")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "zss.transport.protocol_violation");
        assert_eq!(router.peer_count().await, 0);
    }

    #[tokio::test]
    async fn send_requires_identity_and_body() {
        let router = TcpRouter::bind("tcp://127.0.0.1:0").await.unwrap();
        assert!(matches!(
            router.send(vec![Bytes::from_static(b"only-identity")]).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn endpoint_uri_reflects_bound_port() {
        let router = TcpRouter::bind("tcp://127.0.0.1:0").await.unwrap();
        assert_ne!(router.local_addr().port(), 0);
        assert_eq!(router.endpoint(), format!("tcp://{}", router.local_addr()));
    }
}
