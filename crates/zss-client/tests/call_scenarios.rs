//! 调用编排端到端场景
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：在虚拟时间下复现调用的全部结束路径（成功、应用错误、传输错误、超时），
//!   并验证结算唯一、端点恰好关闭一次、追踪头部在嵌套调用中成对恢复。
//! - **设计手法 (How)**：使用 `test_stubs::ScriptedTransport` 控制响应内容与到达时刻，
//!   `tokio::test(start_paused = true)` 让计时器由运行时自动推进，断言不依赖墙钟。
//!
//! # 合同与边界 (What)
//!
//! - 截止时间覆盖连接、发送与等待；到期后返回 599 描述并补做一次追踪终点打点；
//! - 传输错误与畸形响应一律折叠为目录中的 500 描述；
//! - rid 不匹配的响应被丢弃，继续等待真正的响应。

use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use zss_client::{
    CallOptions, ClientConfig, Envelope, ErrorCatalog, ErrorDescriptor, ZssClient,
    metric::{keys, names},
    test_stubs::{ManualClock, RecordingSink, ScriptedTransport, TransportRecord, strip_identity},
};

struct Harness {
    client: ZssClient,
    record: TransportRecord,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
}

fn harness(transport: ScriptedTransport) -> Harness {
    let record = transport.record();
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(1_000));
    let config = ClientConfig::new("tcp://127.0.0.1:7777", "service-identifier")
        .with_identity("clientX")
        .with_header("header", "data");
    let client = ZssClient::builder(config, Arc::new(transport))
        .sink(sink.clone())
        .clock(clock.clone())
        .build()
        .expect("合法配置必须构造成功");
    Harness {
        client,
        record,
        sink,
        clock,
    }
}

fn pong(request: &Envelope) -> Envelope {
    Envelope::reply_to(request, 200, json!("PONG"))
}

#[tokio::test(start_paused = true)]
async fn scenario_a_silent_broker_times_out_with_reserved_code() {
    let h = harness(ScriptedTransport::silent());
    let started = Instant::now();

    let err = h
        .client
        .call("ping", Value::Null, CallOptions::new().timeout(Duration::from_millis(10)))
        .await
        .expect_err("无响应时必须超时");

    assert_eq!(err.code, 599);
    assert_eq!(err, h.client.catalog().timeout());
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(10) && elapsed < Duration::from_millis(12),
        "超时应在约 10ms 时结算，实际 {elapsed:?}"
    );
    assert_eq!(h.record.closed(), 1);
    assert_eq!(
        h.sink.names(),
        vec![
            names::CLIENT_SEND,
            names::CLIENT_RECEIVE,
            names::CLIENT_SPAN
        ],
        "超时路径同样补做终点打点；合成响应没有 micro.bfes，bc.span 被抑制"
    );
    let receive = &h.sink.measurements()[1];
    assert_eq!(receive.metadata.status, Some(599));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_echo_settles_with_pong() {
    let h = harness(ScriptedTransport::replying(pong));

    let reply = h
        .client
        .call("ping", json!({ "hello": "world" }), CallOptions::default())
        .await
        .expect("200 响应必须归类为成功");

    assert_eq!(reply.status, 200);
    assert_eq!(reply.payload, json!("PONG"));
    assert_eq!(reply.headers.get("header"), Some(&json!("data")));
    assert!(reply.headers.contains_key(keys::CLIENT_RECEIVE));
    assert!(!reply.headers.contains_key(keys::CALL_STACK));
    assert_eq!(h.record.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_invalid_descriptor_uses_catalog_entry() {
    let h = harness(ScriptedTransport::replying(|request| {
        Envelope::reply_to(request, 404, json!({}))
    }));

    let err = h
        .client
        .call("missing", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    let expected = ErrorCatalog::default().lookup(404).cloned();
    assert_eq!(Some(err), expected);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_trusted_descriptor_is_passed_through() {
    let h = harness(ScriptedTransport::replying(|request| {
        Envelope::reply_to(
            request,
            404,
            json!({ "code": 404, "userMessage": "x", "developerMessage": "y" }),
        )
    }));

    let err = h
        .client
        .call("missing", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, ErrorDescriptor::new(404, "x", "y"));
}

#[tokio::test(start_paused = true)]
async fn scenario_e_nested_call_restores_outer_send_time() {
    let outer = harness(ScriptedTransport::replying(pong));
    let inner = harness(ScriptedTransport::replying(pong));
    inner.clock.set(2_000);

    let outer_reply = outer
        .client
        .call("outer", Value::Null, CallOptions::default())
        .await
        .unwrap();
    let outer_request = &outer.record.sent_envelopes()[0];
    assert_eq!(outer_request.headers[keys::CLIENT_SEND], json!(1_000));

    // 内层调用沿用外层请求的头部，模拟服务在处理请求时再次发起调用。
    let mut options = CallOptions::default();
    options.headers = outer_request.headers.clone();
    let inner_reply = inner.client.call("inner", Value::Null, options).await.unwrap();

    let inner_request = &inner.record.sent_envelopes()[0];
    assert_eq!(inner_request.headers[keys::CLIENT_SEND], json!(2_000));
    assert_eq!(
        inner_request.headers[keys::CALL_STACK],
        json!([{ "micro.cs": 1_000 }])
    );
    assert_eq!(inner_reply.headers[keys::CLIENT_SEND], json!(1_000));
    assert_eq!(inner_reply.headers[keys::CLIENT_RECEIVE], json!(2_000));
    assert!(!inner_reply.headers.contains_key(keys::CALL_STACK));
    assert!(!outer_reply.headers.contains_key(keys::CLIENT_SEND));
}

#[tokio::test(start_paused = true)]
async fn reply_before_deadline_settles_once_without_late_timer() {
    let h = harness(ScriptedTransport::replying(pong).with_delay(Duration::from_millis(5)));

    h.client
        .call("ping", Value::Null, CallOptions::new().timeout(Duration::from_millis(50)))
        .await
        .expect("响应先于截止时间到达");
    let emitted = h.sink.names();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.sink.names(), emitted, "截止时间过后不得出现第二次结算打点");
    assert_eq!(
        emitted
            .iter()
            .filter(|name| **name == names::CLIENT_RECEIVE)
            .count(),
        1
    );
    assert_eq!(h.record.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_reply_loses_to_deadline() {
    let h = harness(ScriptedTransport::replying(pong).with_delay(Duration::from_millis(30)));

    let err = h
        .client
        .call("ping", Value::Null, CallOptions::new().timeout(Duration::from_millis(20)))
        .await
        .unwrap_err();

    assert_eq!(err.code, 599);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.record.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_error_collapses_to_internal_error() {
    let h = harness(ScriptedTransport::failing_after_send());

    let err = h
        .client
        .call("ping", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, h.client.catalog().internal());
    assert_eq!(h.record.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_connection_collapses_to_internal_error() {
    let h = harness(ScriptedTransport::refusing_connect());

    let err = h
        .client
        .call("ping", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code, 500);
    assert!(h.record.sent().is_empty());
    assert_eq!(h.record.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn stray_reply_is_ignored_until_matching_rid_arrives() {
    let h = harness(ScriptedTransport::replying_frames(|request| {
        let stray = Envelope::reply_to(request, 500, Value::Null).with_rid("someone-else");
        vec![
            strip_identity(stray.to_frames()),
            strip_identity(pong(request).to_frames()),
        ]
    }));

    let reply = h
        .client
        .call("ping", Value::Null, CallOptions::default())
        .await
        .expect("错配响应应被丢弃");

    assert_eq!(reply.payload, json!("PONG"));
}

#[tokio::test(start_paused = true)]
async fn malformed_reply_collapses_to_internal_error() {
    let h = harness(ScriptedTransport::replying_frames(|_| {
        vec![vec![bytes::Bytes::from_static(b"garbage")]]
    }));

    let err = h
        .client
        .call("ping", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code, 500);
    assert_eq!(h.record.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn unregistered_status_falls_back_to_internal_error() {
    let h = harness(ScriptedTransport::replying(|request| {
        Envelope::reply_to(request, 409, json!({ "reason": "conflict" }))
    }));

    let err = h
        .client
        .call("ping", Value::Null, CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, h.client.catalog().internal());
}

#[tokio::test(start_paused = true)]
async fn custom_catalog_is_used_for_fallbacks() {
    let catalog = ErrorCatalog::from_entries([
        ErrorDescriptor::new(500, "custom internal", "boom"),
        ErrorDescriptor::new(599, "custom timeout", "slow"),
    ])
    .expect("包含保留条目的目录必须合法");
    let transport = ScriptedTransport::silent();
    let client = ZssClient::builder(
        ClientConfig::new("tcp://127.0.0.1:7777", "sid"),
        Arc::new(transport),
    )
    .catalog(Arc::new(catalog))
    .build()
    .unwrap();

    let err = client
        .call("ping", Value::Null, CallOptions::new().timeout(Duration::from_millis(1)))
        .await
        .unwrap_err();
    assert_eq!(err.user_message, "custom timeout");
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_use_distinct_endpoints() {
    let h = harness(ScriptedTransport::replying(pong).with_delay(Duration::from_millis(3)));

    let (first, second) = tokio::join!(
        h.client.call("a", Value::Null, CallOptions::default()),
        h.client.call("b", Value::Null, CallOptions::default()),
    );

    assert!(first.is_ok() && second.is_ok());
    let opened = h.record.opened();
    assert_eq!(opened.len(), 2);
    assert_ne!(opened[0], opened[1]);
    assert_eq!(h.record.closed(), 2);
}
