//! 经由真实 TCP 的端到端调用
//!
//! - **核心目标 (Why)**：验证 `ZssClient` + `TcpTransport` + `TcpRouter` 组合后，
//!   身份握手、身份帧剥离与补回、rid 关联以及截止时间在真实套接字上同样成立。
//! - **结构 (How)**：`spawn_broker` 绑定本地随机端口，把收到的请求交给处理函数，
//!   再按请求身份把响应路由回去；处理函数返回 `None` 表示不回包。

use anyhow::Result;
use serde_json::{Value, json};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use zss_client::{
    CallOptions, ClientConfig, Envelope, ErrorCatalog, ErrorDescriptor, ZssClient, metric::keys,
};
use zss_transport_tcp::{TcpRouter, TcpTransport};

type Handler = fn(&Envelope) -> Option<Envelope>;

struct Broker {
    address: String,
    seen: Arc<Mutex<Vec<Envelope>>>,
    task: JoinHandle<()>,
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_broker(handler: Handler) -> Result<Broker> {
    let mut router = TcpRouter::bind("tcp://127.0.0.1:0").await?;
    let address = router.endpoint();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let task = tokio::spawn(async move {
        while let Some(frames) = router.recv().await {
            let Ok(request) = Envelope::parse(&frames) else {
                continue;
            };
            record.lock().unwrap().push(request.clone());
            if let Some(reply) = handler(&request) {
                router.send(reply.to_frames()).await.unwrap();
            }
        }
    });

    Ok(Broker {
        address,
        seen,
        task,
    })
}

fn client(broker: &str) -> Result<ZssClient> {
    let config = ClientConfig::new(broker, "service-identifier").with_identity("clientX");
    Ok(ZssClient::new(config, Arc::new(TcpTransport::new()))?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_broker_returns_pong() -> Result<()> {
    let broker = spawn_broker(|request| Some(Envelope::reply_to(request, 200, json!("PONG")))).await?;
    let client = client(&broker.address)?;

    let reply = client
        .call("ping", json!({ "hello": "world" }), CallOptions::default())
        .await
        .map_err(anyhow::Error::new)?;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.payload, json!("PONG"));
    assert!(reply.headers.contains_key(keys::CLIENT_RECEIVE));

    let seen = broker.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].address.sid, "SERVICE-IDENTIFIER");
    assert_eq!(seen[0].address.verb, "PING");
    assert!(seen[0].identity.starts_with("clientX#"));
    assert_eq!(seen[0].payload, json!({ "hello": "world" }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn not_found_reply_resolves_catalog_entry() -> Result<()> {
    let broker = spawn_broker(|request| Some(Envelope::reply_to(request, 404, json!({})))).await?;
    let client = client(&broker.address)?;

    let err = client
        .call("missing", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(Some(err), ErrorCatalog::default().lookup(404).cloned());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_descriptor_survives_the_wire() -> Result<()> {
    let broker = spawn_broker(|request| {
        Some(Envelope::reply_to(
            request,
            403,
            json!({ "code": 403, "userMessage": "x", "developerMessage": "y", "traceId": "t-1" }),
        ))
    })
    .await?;
    let client = client(&broker.address)?;

    let err = client
        .call("secret", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code, 403);
    assert_eq!(err.user_message, "x");
    assert_eq!(err.developer_message, "y");
    assert_eq!(err.extra.get("traceId"), Some(&json!("t-1")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_is_an_internal_error() -> Result<()> {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let client = client(&format!("tcp://127.0.0.1:{port}"))?;

    let err = client
        .call("ping", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, ErrorCatalog::default().internal());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_broker_hits_the_deadline() -> Result<()> {
    let broker = spawn_broker(|_| None).await?;
    let client = client(&broker.address)?;

    let err = client
        .call(
            "ping",
            Value::Null,
            CallOptions::new().timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, 599);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_are_routed_to_their_own_endpoint() -> Result<()> {
    let broker =
        spawn_broker(|request| Some(Envelope::reply_to(request, 200, request.payload.clone())))
            .await?;
    let client = Arc::new(client(&broker.address)?);

    let calls = (0..8).map(|index| {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call("echo", json!(index), CallOptions::default())
                .await
        })
    });
    let mut payloads = Vec::new();
    for call in calls.collect::<Vec<_>>() {
        let reply = call.await?.map_err(|err: ErrorDescriptor| anyhow::Error::new(err))?;
        payloads.push(reply.payload);
    }

    assert_eq!(payloads, (0..8).map(|index| json!(index)).collect::<Vec<_>>());
    let identities: BTreeSet<_> = broker
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|request| request.identity.clone())
        .collect();
    assert_eq!(identities.len(), 8);
    Ok(())
}
