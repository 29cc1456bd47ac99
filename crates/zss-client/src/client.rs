//! 调用编排器与客户端门面。
//!
//! # 设计动机（Why）
//! - 一次调用需要在“收到响应”“截止时间到期”“传输报错”三种事件之间竞争，
//!   且只能以其中最先发生的一个结束；
//! - 无论以哪种方式结束，调用独占的端点都必须被关闭且只关闭一次。
//!
//! # 结构说明（How）
//! - [`ZssClient::call`] 合并选项、构造请求信封，然后交给内部的 `CallContext`；
//! - `CallContext` 以 [`tokio::time::timeout_at`] 驱动完整的交换过程（连接、发送、等待），
//!   交换 future 与截止计时器在同一个 `select` 中竞争，首个完成者决定结果，
//!   另一方随 future 一并丢弃，不会再次结算；
//! - `CallContext::settle` 按值消费上下文，结算在类型层面只会发生一次；
//! - 端点由 `EndpointGuard` 持有：结算时显式释放，若调用方中途丢弃 future，
//!   `Drop` 同样会关闭端点。
//!
//! # 风险提示（Trade-offs）
//! - 传输错误的具体原因只写入 WARN 日志，不进入返回值；排障依赖日志采集；
//! - 截止时间覆盖连接阶段，慢连接会挤占等待响应的时间。

use crate::{
    config::{CallOptions, ClientConfig, ConfigError},
    envelope::{Envelope, EnvelopeError, Headers},
    error::{ErrorCatalog, ErrorDescriptor, TIMEOUT, classify},
    metric::{Clock, MetricSink, SystemClock, TraceStamper, TracingMetricSink},
    transport::{Endpoint, EndpointEvent, Transport, TransportError},
};
use bytes::Bytes;
use serde_json::Value;
use std::{fmt, sync::Arc};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// 成功调用的结果。
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub payload: Value,
    pub headers: Headers,
}

/// 经由 Broker 发起请求/响应调用的客户端。
///
/// 实例可在多个任务间共享（`&self` 调用）；每次调用使用独立端点与身份，互不串扰。
pub struct ZssClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    catalog: Arc<ErrorCatalog>,
    stamper: TraceStamper,
}

impl ZssClient {
    /// 使用内置错误目录、系统时钟与 `tracing` 指标下沉端构造客户端。
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        Self::builder(config, transport).build()
    }

    pub fn builder(config: ClientConfig, transport: Arc<dyn Transport>) -> ZssClientBuilder {
        ZssClientBuilder {
            config,
            transport,
            catalog: None,
            clock: None,
            sink: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ErrorCatalog {
        &self.catalog
    }

    /// 发起一次调用。
    ///
    /// # 教案式说明
    /// - **前置条件**：`verb` 非空，否则直接返回目录中的 400 描述，不触碰传输层；
    /// - **逻辑 (How)**：
    ///   1. 合并调用选项与实例配置，确定 sid、截止时间与头部；
    ///   2. 以 `<identity>#<uuid>` 打开独占端点，打开失败按传输错误处理；
    ///   3. 构造请求信封并执行追踪起点打点；
    ///   4. 在截止时间内完成连接、发送与等待，结算后释放端点；
    /// - **返回值**：成功为 [`Reply`]，失败一律为 [`ErrorDescriptor`]：
    ///   应用错误透传或取自目录，传输错误为 500，超时为 599。
    pub async fn call(
        &self,
        verb: &str,
        payload: Value,
        options: CallOptions,
    ) -> Result<Reply, ErrorDescriptor> {
        if verb.trim().is_empty() {
            tracing::warn!(sid = self.config.sid(), "rejecting call with empty verb");
            return Err(self.catalog.bad_request());
        }

        let resolved = self.config.resolve(options);
        let deadline = Instant::now().checked_add(resolved.timeout);
        let identity = format!("{}#{}", self.config.identity(), Uuid::new_v4());
        let request = Envelope::request(&resolved.sid, verb)
            .with_identity(identity.clone())
            .with_headers(resolved.headers)
            .with_payload(payload);

        let span = tracing::debug_span!(
            "zss.call",
            sid = %request.address.sid,
            verb = %request.address.verb,
            rid = %request.rid,
        );

        async move {
            let endpoint = match self.transport.open(&identity) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    tracing::warn!(code = err.code(), error = %err, "failed to open endpoint");
                    return Err(self.catalog.internal());
                }
            };
            let request = self.stamper.start(request);
            CallContext {
                client: self,
                request,
                deadline,
                endpoint: EndpointGuard::hold(endpoint),
            }
            .run()
            .await
        }
        .instrument(span)
        .await
    }
}

impl fmt::Debug for ZssClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZssClient")
            .field("config", &self.config)
            .field("catalog_entries", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

/// [`ZssClient`] 构造器，允许替换错误目录、时钟与指标下沉端。
pub struct ZssClientBuilder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    catalog: Option<Arc<ErrorCatalog>>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn MetricSink>>,
}

impl ZssClientBuilder {
    pub fn catalog(mut self, catalog: Arc<ErrorCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 校验配置并完成构造。
    pub fn build(self) -> Result<ZssClient, ConfigError> {
        self.config.validate()?;
        let stamper = TraceStamper::new(
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.sink.unwrap_or_else(|| Arc::new(TracingMetricSink)),
        );
        Ok(ZssClient {
            config: self.config,
            transport: self.transport,
            catalog: self.catalog.unwrap_or_default(),
            stamper,
        })
    }
}

/// 交换过程被中断的原因，仅用于日志。
#[derive(Debug)]
enum Interruption {
    Transport(TransportError),
    Malformed(EnvelopeError),
}

/// 单次调用的上下文，持有请求、截止时间与独占端点。
///
/// `deadline` 为 `None` 表示超时时长超出时钟可表示的范围，此时不设截止时间。
struct CallContext<'a> {
    client: &'a ZssClient,
    request: Envelope,
    deadline: Option<Instant>,
    endpoint: EndpointGuard,
}

impl CallContext<'_> {
    async fn run(mut self) -> Result<Reply, ErrorDescriptor> {
        let broker = self.client.config.broker();
        let outcome = match self.endpoint.get() {
            Some(endpoint) => match self.deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, exchange(endpoint, broker, &self.request))
                        .await
                        .ok()
                }
                None => Some(exchange(endpoint, broker, &self.request).await),
            },
            None => Some(Err(Interruption::Transport(TransportError::Closed))),
        };
        self.settle(outcome)
    }

    /// 结算：`None` 表示截止时间先于交换完成。
    fn settle(
        mut self,
        outcome: Option<Result<Envelope, Interruption>>,
    ) -> Result<Reply, ErrorDescriptor> {
        let ZssClient {
            catalog, stamper, ..
        } = self.client;

        let result = match outcome {
            Some(Ok(reply)) => classify(stamper.end(reply), catalog),
            Some(Err(Interruption::Transport(err))) => {
                tracing::warn!(code = err.code(), error = %err, "transport failure");
                Err(catalog.internal())
            }
            Some(Err(Interruption::Malformed(err))) => {
                tracing::warn!(code = err.code(), error = %err, "malformed reply");
                Err(catalog.internal())
            }
            None => {
                let descriptor = catalog.timeout();
                tracing::debug!("call deadline expired");
                stamper.end(Envelope::reply_to(
                    &self.request,
                    TIMEOUT,
                    descriptor.to_payload(),
                ));
                Err(descriptor)
            }
        };

        self.endpoint.release();
        result
    }
}

/// 连接、发送并等待与请求 `rid` 匹配的响应。
async fn exchange(
    endpoint: &mut dyn Endpoint,
    broker: &str,
    request: &Envelope,
) -> Result<Envelope, Interruption> {
    endpoint
        .connect(broker)
        .await
        .map_err(Interruption::Transport)?;

    let mut frames = request.to_frames();
    frames.remove(0);
    endpoint.send(frames).await.map_err(Interruption::Transport)?;

    loop {
        match endpoint.next_event().await {
            EndpointEvent::Message(mut frames) => {
                frames.insert(0, Bytes::from(endpoint.identity().to_owned()));
                let reply = Envelope::parse(&frames).map_err(Interruption::Malformed)?;
                if reply.rid == request.rid {
                    return Ok(reply);
                }
                tracing::debug!(stray = %reply.rid, "discarding reply for another request");
            }
            EndpointEvent::Error(err) => return Err(Interruption::Transport(err)),
        }
    }
}

/// 独占端点的持有者，保证端点恰好关闭一次。
struct EndpointGuard {
    endpoint: Option<Box<dyn Endpoint>>,
}

impl EndpointGuard {
    fn hold(endpoint: Box<dyn Endpoint>) -> Self {
        Self {
            endpoint: Some(endpoint),
        }
    }

    fn get(&mut self) -> Option<&mut (dyn Endpoint + 'static)> {
        self.endpoint.as_deref_mut()
    }

    fn release(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.close();
        }
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        self.release();
    }
}
