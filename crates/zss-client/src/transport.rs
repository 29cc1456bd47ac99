//! 传输层抽象。
//!
//! # 角色定位（Why）
//! - 编排器只依赖“按身份打开端点、连接、发送帧序列、等待事件、关闭”这一最小能力集合；
//! - 具体实现（TCP、内存桩等）位于独立 crate 或 [`crate::test_stubs`]，编排器无需感知套接字细节。
//!
//! # 契约说明（What）
//! - [`Transport::open`] 为每次调用创建独占端点，端点之间不共享连接；
//! - 发往本端点的消息不携带首部身份帧，由编排器在解析前补回；
//! - [`Endpoint::close`] 同步且幂等，多次调用只有第一次生效；
//! - [`Endpoint::next_event`] 在端点关闭或连接断开后返回 [`EndpointEvent::Error`]，
//!   不得无限挂起于已失效的连接之上。

use crate::envelope::Frames;
use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// 端点工厂。
pub trait Transport: Send + Sync + 'static {
    /// 以给定身份创建尚未连接的端点。
    fn open(&self, identity: &str) -> Result<Box<dyn Endpoint>, TransportError>;
}

/// 单次调用独占的消息端点。
#[async_trait]
pub trait Endpoint: Send {
    /// 端点在 Broker 侧的路由身份。
    fn identity(&self) -> &str;

    /// 连接 Broker，地址格式由实现定义（例如 `tcp://host:port`）。
    async fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    /// 发送一条多帧消息。
    async fn send(&mut self, frames: Frames) -> Result<(), TransportError>;

    /// 等待下一条入站消息或传输错误。
    async fn next_event(&mut self) -> EndpointEvent;

    /// 释放底层资源。
    fn close(&mut self);
}

/// 端点上可观察到的事件。
#[derive(Debug)]
pub enum EndpointEvent {
    Message(Frames),
    Error(TransportError),
}

/// 一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub code: &'static str,
    pub message: &'static str,
}

impl Operation {
    pub const BIND: Operation = Operation {
        code: "zss.transport.bind_failed",
        message: "bind",
    };
    pub const ACCEPT: Operation = Operation {
        code: "zss.transport.accept_failed",
        message: "accept",
    };
    pub const CONNECT: Operation = Operation {
        code: "zss.transport.connect_failed",
        message: "connect",
    };
    pub const SEND: Operation = Operation {
        code: "zss.transport.send_failed",
        message: "send",
    };
    pub const RECEIVE: Operation = Operation {
        code: "zss.transport.receive_failed",
        message: "receive",
    };
    pub const CONFIGURE: Operation = Operation {
        code: "zss.transport.configure_failed",
        message: "configure",
    };
}

/// 传输层错误。
///
/// 该错误只在传输实现与编排器之间流动；编排器将其记录到日志后统一折叠为 500 描述，
/// 不会返回给调用方。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{}: {source}", .operation.message)]
    Io {
        operation: Operation,
        #[source]
        source: io::Error,
    },
    #[error("invalid transport address `{0}`")]
    InvalidAddress(String),
    #[error("transport protocol violation: {0}")]
    Protocol(String),
    #[error("endpoint is closed")]
    Closed,
}

impl TransportError {
    pub fn io(operation: Operation, source: io::Error) -> Self {
        TransportError::Io { operation, source }
    }

    /// 稳定错误码，供日志聚合与告警规则匹配。
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Io { operation, .. } => operation.code,
            TransportError::InvalidAddress(_) => "zss.transport.invalid_address",
            TransportError::Protocol(_) => "zss.transport.protocol_violation",
            TransportError::Closed => "zss.transport.closed",
        }
    }
}
