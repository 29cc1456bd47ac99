//! 追踪头部栈与客户端打点。
//!
//! # 设计动机（Why）
//! - Broker 与服务会在信封头部写入 `micro.*` 时间戳，事后据此还原端到端时延；
//! - 服务 A 处理请求时再调用服务 B，会复用同一条头部通道。若 B 的打点直接覆盖 A 的时间戳，
//!   A 返回时就无法计算自己的跨度。因此在发起内层调用前把祖先的追踪头压入
//!   `micro-metrics-stack`，内层调用结束时再弹出恢复，形成成对的 push/pop。
//!
//! # 核心契约（What）
//! - [`push_trace_frame`]/[`pop_trace_frame`] 为纯函数：输入头部，输出新头部，不修改入参；
//! - [`TraceStamper::start`] 在发送前打 `micro.cs` 并上报 `micro.cs` 指标；
//! - [`TraceStamper::end`] 在收到响应（或合成超时响应）后打 `micro.cr`，恢复祖先头部，
//!   并上报 `micro.cr`、`micro.c.span`、`micro.bc.span`；
//! - 非有限值（缺失时间戳导致的 NaN）不会送达 [`MetricSink`]。
//!
//! # 风险与考量（Trade-offs）
//! - 祖先快照只包含当时真实存在的键，缺失的键在恢复后依然缺失，不补零；
//! - 时间戳取自注入的 [`Clock`]，跨主机时钟漂移会直接反映在跨度上，由下游聚合端处理。

use crate::envelope::{Address, Envelope, Headers, MessageType};
use serde_json::Value;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// 追踪头部键。取值与 Broker 侧约定一致。
pub mod keys {
    /// 客户端发送时间。
    pub const CLIENT_SEND: &str = "micro.cs";
    /// 客户端接收时间。
    pub const CLIENT_RECEIVE: &str = "micro.cr";
    /// 服务端发送时间。
    pub const SERVER_SEND: &str = "micro.ss";
    /// 服务端接收时间。
    pub const SERVER_RECEIVE: &str = "micro.sr";
    /// Broker 前向（客户端 → 服务）发送时间。
    pub const BROKER_FORWARD_SEND: &str = "micro.bfes";
    /// Broker 前向接收时间。
    pub const BROKER_FORWARD_RECEIVE: &str = "micro.bfer";
    /// Broker 回程（服务 → 客户端）发送时间。
    pub const BROKER_BACKWARD_SEND: &str = "micro.bbes";
    /// Broker 回程接收时间。
    pub const BROKER_BACKWARD_RECEIVE: &str = "micro.bber";
    /// 祖先调用追踪头快照组成的栈。
    pub const CALL_STACK: &str = "micro-metrics-stack";

    /// 全部保留的时间戳键。
    pub const TRACE_KEYS: [&str; 8] = [
        CLIENT_SEND,
        CLIENT_RECEIVE,
        SERVER_SEND,
        SERVER_RECEIVE,
        BROKER_FORWARD_SEND,
        BROKER_FORWARD_RECEIVE,
        BROKER_BACKWARD_SEND,
        BROKER_BACKWARD_RECEIVE,
    ];
}

/// 客户端上报的指标名。
pub mod names {
    pub const CLIENT_SEND: &str = "micro.cs";
    pub const CLIENT_RECEIVE: &str = "micro.cr";
    /// 客户端发送到客户端接收的跨度。
    pub const CLIENT_SPAN: &str = "micro.c.span";
    /// Broker 前向发送到客户端接收的跨度。
    pub const BROKER_TO_CLIENT_SPAN: &str = "micro.bc.span";
}

/// 判断键是否为保留的时间戳键。
pub fn is_trace_key(key: &str) -> bool {
    keys::TRACE_KEYS.contains(&key)
}

/// 发起调用前的头部变换（push）。
///
/// # 教案式说明
/// - **逻辑 (How)**：
///   1. 收集当前头部中已存在的时间戳键，视为仍在进行中的祖先调用，非空时追加到栈尾；
///   2. 去掉全部时间戳键与原始栈键；
///   3. 写入 `micro.cs = now`，栈非空时重新挂回。
/// - **契约 (What)**：输入不被修改；业务头部原样保留。
pub fn push_trace_frame(headers: &Headers, now: i64) -> Headers {
    let mut stack = call_stack(headers);
    let ancestor: Headers = keys::TRACE_KEYS
        .iter()
        .filter_map(|key| headers.get(*key).map(|value| ((*key).to_owned(), value.clone())))
        .collect();
    if !ancestor.is_empty() {
        stack.push(Value::Object(ancestor));
    }

    let mut next = strip_trace(headers);
    next.insert(keys::CLIENT_SEND.to_owned(), Value::from(now));
    if !stack.is_empty() {
        next.insert(keys::CALL_STACK.to_owned(), Value::Array(stack));
    }
    next
}

/// 收到响应后的头部变换（pop）。
///
/// # 教案式说明
/// - **逻辑 (How)**：
///   1. 弹出栈尾快照（即直接外层调用的追踪头），调用嵌套严格后进先出；
///   2. 去掉全部时间戳键与原始栈键，合入弹出的快照；
///   3. 写入 `micro.cr = now`，本次接收时间优先于快照中的旧值；
///   4. 栈中剩余的更外层快照原样挂回。
/// - **契约 (What)**：最外层调用结束后头部中不再有栈键，时间戳键只剩本次的 `micro.cr`。
pub fn pop_trace_frame(headers: &Headers, now: i64) -> Headers {
    let mut stack = call_stack(headers);
    let ancestor = stack.pop();

    let mut next = strip_trace(headers);
    if let Some(Value::Object(entry)) = ancestor {
        next.extend(entry.into_iter().filter(|(key, _)| is_trace_key(key)));
    }
    next.insert(keys::CLIENT_RECEIVE.to_owned(), Value::from(now));
    if !stack.is_empty() {
        next.insert(keys::CALL_STACK.to_owned(), Value::Array(stack));
    }
    next
}

fn call_stack(headers: &Headers) -> Vec<Value> {
    match headers.get(keys::CALL_STACK) {
        Some(Value::Array(entries)) => entries.clone(),
        _ => Vec::new(),
    }
}

fn strip_trace(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(key, _)| !is_trace_key(key) && key.as_str() != keys::CALL_STACK)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// 指标附带的信封元数据。
#[derive(Clone, Debug, PartialEq)]
pub struct MetricMetadata {
    pub kind: MessageType,
    pub rid: String,
    pub address: Address,
    pub status: Option<u16>,
    pub identity: String,
    pub transaction: Option<String>,
}

impl MetricMetadata {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            kind: envelope.kind,
            rid: envelope.rid.clone(),
            address: envelope.address.clone(),
            status: envelope.status,
            identity: envelope.identity.clone(),
            transaction: envelope.transaction().map(str::to_owned),
        }
    }
}

/// 一次数值打点。
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub name: &'static str,
    pub value: f64,
    pub metadata: MetricMetadata,
}

/// 指标下沉端。
///
/// 实现必须线程安全；`emit` 在调用路径上同步执行，不应阻塞。
pub trait MetricSink: Send + Sync + 'static {
    fn emit(&self, measurement: &Measurement);
}

/// 将指标写入 `tracing` 日志的默认下沉端。
///
/// 事件目标为 `micro.metric.client`，级别 INFO，可通过 `EnvFilter` 单独开关。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetricSink;

impl MetricSink for TracingMetricSink {
    fn emit(&self, measurement: &Measurement) {
        let metadata = &measurement.metadata;
        tracing::info!(
            target: "micro.metric.client",
            metric = measurement.name,
            value = measurement.value,
            kind = %metadata.kind,
            rid = %metadata.rid,
            address = %metadata.address,
            status = ?metadata.status,
            client = %metadata.identity,
            transaction = ?metadata.transaction,
            "Publishing metric \"{}\":{}ms",
            measurement.name,
            measurement.value
        );
    }
}

/// 丢弃所有指标的下沉端。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {
    fn emit(&self, _measurement: &Measurement) {}
}

/// 毫秒级墙钟。
///
/// 追踪时间戳需要跨进程比较，因此使用 Unix 纪元毫秒而非单调时钟。
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// 系统墙钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

/// 绑定时钟与下沉端的追踪打点器。
#[derive(Clone)]
pub struct TraceStamper {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricSink>,
}

impl TraceStamper {
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn MetricSink>) -> Self {
        Self { clock, sink }
    }

    /// 发送前打点：压栈祖先追踪头并写入 `micro.cs`。
    pub fn start(&self, envelope: Envelope) -> Envelope {
        let now = self.clock.now_millis();
        let headers = push_trace_frame(&envelope.headers, now);
        let stamped = Envelope {
            headers,
            ..envelope
        };
        self.publish(names::CLIENT_SEND, now as f64, &stamped);
        stamped
    }

    /// 接收后打点：写入 `micro.cr`，恢复祖先追踪头，并上报跨度。
    ///
    /// 跨度基于入参头部（即本次调用自己的追踪头）计算，而非恢复后的祖先值。
    pub fn end(&self, envelope: Envelope) -> Envelope {
        let now = self.clock.now_millis();
        let sent = timestamp(&envelope.headers, keys::CLIENT_SEND);
        let forwarded = timestamp(&envelope.headers, keys::BROKER_FORWARD_SEND);
        let headers = pop_trace_frame(&envelope.headers, now);
        let stamped = Envelope {
            headers,
            ..envelope
        };

        let now = now as f64;
        self.publish(names::CLIENT_RECEIVE, now, &stamped);
        self.publish(names::CLIENT_SPAN, now - sent, &stamped);
        self.publish(names::BROKER_TO_CLIENT_SPAN, now - forwarded, &stamped);
        stamped
    }

    fn publish(&self, name: &'static str, value: f64, envelope: &Envelope) {
        if !value.is_finite() {
            return;
        }
        self.sink.emit(&Measurement {
            name,
            value,
            metadata: MetricMetadata::from_envelope(envelope),
        });
    }
}

impl Default for TraceStamper {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TracingMetricSink))
    }
}

impl std::fmt::Debug for TraceStamper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStamper").finish_non_exhaustive()
    }
}

/// 读取数值时间戳；缺失或非数值时返回 NaN，由 `publish` 抑制。
fn timestamp(headers: &Headers, key: &str) -> f64 {
    headers.get(key).and_then(Value::as_f64).unwrap_or(f64::NAN)
}
