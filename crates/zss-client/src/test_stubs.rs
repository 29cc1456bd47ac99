//! 测试桩：脚本化传输、记录型指标下沉端与手动时钟。
//!
//! # 设计动机（Why）
//! - 编排器的竞态（响应、超时、传输错误）需要可重复地构造，真实套接字无法精确控制时序；
//! - 桩对象配合 `tokio::test(start_paused = true)` 使用，时间由运行时虚拟推进，测试不依赖墙钟。
//!
//! # 使用方式（How）
//! - [`ScriptedTransport`] 以构造函数选定行为，[`ScriptedTransport::record`] 获取共享的观测记录；
//! - 端点收到请求后按脚本生成响应帧，响应在 `delay` 之后才可被 `next_event` 读到；
//! - 下游 crate 通过 `test-util` feature 复用本模块。

use crate::{
    envelope::{Envelope, Frames},
    metric::{Clock, Measurement, MetricSink},
    transport::{Endpoint, EndpointEvent, Operation, Transport, TransportError},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;

type Responder = Arc<dyn Fn(&Envelope) -> Vec<Frames> + Send + Sync>;

#[derive(Clone)]
enum Script {
    /// 对每个请求回放若干条帧序列（不含首部身份帧）。
    Respond { delay: Duration, responder: Responder },
    /// 发送成功后上报一次传输错误。
    FailAfterSend,
    /// 连接阶段即失败。
    RefuseConnect,
    /// 打开端点即失败。
    Unavailable,
    /// 永不响应。
    Silence,
}

/// 按脚本响应的内存传输。
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Script,
    record: TransportRecord,
}

impl ScriptedTransport {
    /// 每个请求回放一条由 `reply` 构造的响应。
    pub fn replying<F>(reply: F) -> Self
    where
        F: Fn(&Envelope) -> Envelope + Send + Sync + 'static,
    {
        Self::replying_frames(move |request| vec![strip_identity(reply(request).to_frames())])
    }

    /// 每个请求回放任意帧序列，用于构造错配或畸形响应。
    pub fn replying_frames<F>(frames: F) -> Self
    where
        F: Fn(&Envelope) -> Vec<Frames> + Send + Sync + 'static,
    {
        Self::with_script(Script::Respond {
            delay: Duration::ZERO,
            responder: Arc::new(frames),
        })
    }

    pub fn silent() -> Self {
        Self::with_script(Script::Silence)
    }

    pub fn failing_after_send() -> Self {
        Self::with_script(Script::FailAfterSend)
    }

    pub fn refusing_connect() -> Self {
        Self::with_script(Script::RefuseConnect)
    }

    pub fn unavailable() -> Self {
        Self::with_script(Script::Unavailable)
    }

    /// 为响应增加固定延迟；对非响应型脚本无效。
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if let Script::Respond { delay: current, .. } = &mut self.script {
            *current = delay;
        }
        self
    }

    /// 共享的观测记录。
    pub fn record(&self) -> TransportRecord {
        self.record.clone()
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            record: TransportRecord::default(),
        }
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, identity: &str) -> Result<Box<dyn Endpoint>, TransportError> {
        if matches!(self.script, Script::Unavailable) {
            return Err(TransportError::Protocol("scripted transport unavailable".into()));
        }
        self.record.lock().opened.push(identity.to_owned());
        Ok(Box::new(ScriptedEndpoint {
            identity: identity.to_owned(),
            script: self.script.clone(),
            record: self.record.clone(),
            inbound: VecDeque::new(),
            failed: false,
            closed: false,
        }))
    }
}

struct ScriptedEndpoint {
    identity: String,
    script: Script,
    record: TransportRecord,
    inbound: VecDeque<(Instant, Frames)>,
    failed: bool,
    closed: bool,
}

#[async_trait]
impl Endpoint for ScriptedEndpoint {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        self.record.lock().connected.push(address.to_owned());
        if matches!(self.script, Script::RefuseConnect) {
            return Err(TransportError::io(
                Operation::CONNECT,
                io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"),
            ));
        }
        Ok(())
    }

    async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.record
            .lock()
            .sent
            .push((self.identity.clone(), frames.clone()));

        match &self.script {
            Script::Respond { delay, responder } => {
                let mut full = frames;
                full.insert(0, Bytes::from(self.identity.clone()));
                if let Ok(request) = Envelope::parse(&full) {
                    let ready = Instant::now() + *delay;
                    self.inbound
                        .extend(responder(&request).into_iter().map(|reply| (ready, reply)));
                }
            }
            Script::FailAfterSend => self.failed = true,
            _ => {}
        }
        Ok(())
    }

    async fn next_event(&mut self) -> EndpointEvent {
        if self.closed {
            return EndpointEvent::Error(TransportError::Closed);
        }
        if self.failed {
            self.failed = false;
            return EndpointEvent::Error(TransportError::io(
                Operation::RECEIVE,
                io::Error::new(io::ErrorKind::ConnectionReset, "scripted reset"),
            ));
        }
        match self.inbound.pop_front() {
            Some((ready, frames)) => {
                tokio::time::sleep_until(ready).await;
                EndpointEvent::Message(frames)
            }
            None => std::future::pending().await,
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inbound.clear();
            self.record.lock().closed += 1;
        }
    }
}

/// 脚本化传输的观测记录，可在测试与被测对象之间共享。
#[derive(Clone, Default)]
pub struct TransportRecord {
    inner: Arc<Mutex<RecordInner>>,
}

#[derive(Default)]
struct RecordInner {
    opened: Vec<String>,
    connected: Vec<String>,
    /// 发送方身份与帧序列成对记录。
    sent: Vec<(String, Frames)>,
    closed: usize,
}

impl TransportRecord {
    /// 已打开端点的身份，按打开顺序排列。
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    pub fn connected(&self) -> Vec<String> {
        self.lock().connected.clone()
    }

    /// 已发送的原始帧序列（不含首部身份帧）。
    pub fn sent(&self) -> Vec<Frames> {
        self.lock()
            .sent
            .iter()
            .map(|(_, frames)| frames.clone())
            .collect()
    }

    /// 已发送的请求信封，身份取自实际发送的端点。
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.lock()
            .sent
            .iter()
            .filter_map(|(identity, frames)| {
                let mut full = frames.clone();
                full.insert(0, Bytes::from(identity.clone()));
                Envelope::parse(&full).ok()
            })
            .collect()
    }

    /// 端点被关闭的总次数。
    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 去掉首部身份帧，模拟 Broker 回送给直连端点的消息形态。
pub fn strip_identity(mut frames: Frames) -> Frames {
    if !frames.is_empty() {
        frames.remove(0);
    }
    frames
}

/// 记录全部指标的下沉端。
#[derive(Debug, Default)]
pub struct RecordingSink {
    measurements: Mutex<Vec<Measurement>>,
}

impl RecordingSink {
    pub fn measurements(&self) -> Vec<Measurement> {
        self.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.lock().iter().map(|measurement| measurement.name).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Measurement>> {
        self.measurements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricSink for RecordingSink {
    fn emit(&self, measurement: &Measurement) {
        self.lock().push(measurement.clone());
    }
}

/// 手动推进的毫秒时钟。
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sent_envelopes_keep_the_sending_identity() {
        let transport = ScriptedTransport::silent();
        let record = transport.record();
        let mut idle = transport.open("client#idle").unwrap();
        let mut busy = transport.open("client#busy").unwrap();

        let request = Envelope::request("sid", "verb").with_identity("client#busy");
        busy.send(strip_identity(request.to_frames())).await.unwrap();
        idle.close();

        let sent = record.sent_envelopes();
        assert_eq!(record.opened(), vec!["client#idle", "client#busy"]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].identity, "client#busy");
        assert_eq!(sent[0].rid, request.rid);
    }
}
