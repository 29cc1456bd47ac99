//! 请求/响应信封模型与多帧编解码。
//!
//! # 设计动机（Why）
//! - Broker 以“帧序列”作为路由单位：首帧为来源身份，随后依次是协议标识、消息类型、
//!   关联 ID、地址、头部、状态与负载；客户端需要与之逐帧对齐；
//! - 将构造与解析集中在本模块，编排器只需关心 [`Envelope`] 的字段语义。
//!
//! # 帧布局（What）
//! | 序号 | 内容 | 编码 |
//! |---|---|---|
//! | 0 | identity | UTF-8 |
//! | 1 | 协议标识 [`PROTOCOL`] | UTF-8 |
//! | 2 | `REQ` / `REP` | UTF-8 |
//! | 3 | rid | UTF-8 |
//! | 4 | address | JSON 对象 `{sid, sversion, verb}` |
//! | 5 | headers | JSON 对象 |
//! | 6 | status | 十进制 ASCII，请求为空帧 |
//! | 7 | payload | JSON 值 |
//!
//! # 注意事项（Trade-offs）
//! - 头部与负载均以 JSON 承载，便于与其他语言实现的 Broker 互通；代价是二进制负载需自行编码。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// 协议标识帧的固定取值。
pub const PROTOCOL: &str = "ZSS:0.0";

/// 服务版本缺省值，表示由 Broker 选择任意可用版本。
pub const ANY_VERSION: &str = "*";

/// 头部中承载业务事务标识的键。
pub const TRANSACTION_HEADER: &str = "transaction";

const FRAME_COUNT: usize = 8;

/// 传输层搬运的帧序列。
pub type Frames = Vec<Bytes>;

/// 信封头部：字符串键到任意 JSON 值的映射。
pub type Headers = Map<String, Value>;

/// 消息方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// 客户端发出的请求。
    Request,
    /// 服务经由 Broker 回送的响应。
    Reply,
}

impl MessageType {
    /// 返回线上编码。
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "REQ",
            MessageType::Reply => "REP",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "REQ" => Some(MessageType::Request),
            "REP" => Some(MessageType::Reply),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务寻址三元组。
///
/// `sid` 与 `verb` 在构造时统一转为大写，保证 Broker 路由表的匹配不受调用方书写习惯影响。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub sid: String,
    pub sversion: String,
    pub verb: String,
}

impl Address {
    /// 以缺省版本构造地址，`sid`/`verb` 会被大写化。
    pub fn new(sid: &str, verb: &str) -> Self {
        Self {
            sid: sid.to_uppercase(),
            sversion: ANY_VERSION.to_owned(),
            verb: verb.to_uppercase(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.sid, self.sversion, self.verb)
    }
}

/// 请求或响应的完整信封。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 作为编排器与 Broker 之间唯一的数据单元，承载路由、关联与追踪所需的全部元数据。
///
/// ## 契约 (What)
/// - `rid` 在请求与其响应之间保持不变，客户端据此丢弃错配的回包；
/// - `status` 仅在响应上出现，请求编码为空帧；
/// - `headers` 中 `micro.*` 键由 [`crate::metric`] 维护，业务不应直接写入。
///
/// ## 注意事项 (Trade-offs)
/// - 字段保持公开，便于 Broker/Worker 侧测试直接构造；构造器负责大写化与 ID 生成，
///   直接改写 `address` 时需调用方自行保证大写约束。
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub kind: MessageType,
    pub address: Address,
    pub rid: String,
    pub identity: String,
    pub headers: Headers,
    pub payload: Value,
    pub status: Option<u16>,
}

impl Envelope {
    /// 构造请求信封：地址大写化，并生成新的 UUID v4 作为 `rid`。
    pub fn request(sid: &str, verb: &str) -> Self {
        Self {
            kind: MessageType::Request,
            address: Address::new(sid, verb),
            rid: Uuid::new_v4().to_string(),
            identity: String::new(),
            headers: Headers::new(),
            payload: Value::Null,
            status: None,
        }
    }

    /// 基于请求构造响应，沿用地址、`rid`、身份与头部。
    pub fn reply_to(request: &Envelope, status: u16, payload: Value) -> Self {
        Self {
            kind: MessageType::Reply,
            address: request.address.clone(),
            rid: request.rid.clone(),
            identity: request.identity.clone(),
            headers: request.headers.clone(),
            payload,
            status: Some(status),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// 使用调用方提供的关联 ID 替换自动生成的值。
    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        self.rid = rid.into();
        self
    }

    pub fn with_version(mut self, sversion: impl Into<String>) -> Self {
        self.address.sversion = sversion.into();
        self
    }

    /// 读取头部中的事务标识（若存在且为字符串）。
    pub fn transaction(&self) -> Option<&str> {
        self.headers.get(TRANSACTION_HEADER).and_then(Value::as_str)
    }

    /// 编码为完整帧序列（含首部身份帧）。
    pub fn to_frames(&self) -> Frames {
        let address = serde_json::json!({
            "sid": self.address.sid,
            "sversion": self.address.sversion,
            "verb": self.address.verb,
        });
        let status = self
            .status
            .map(|status| Bytes::from(status.to_string()))
            .unwrap_or_default();

        vec![
            Bytes::from(self.identity.clone()),
            Bytes::from_static(PROTOCOL.as_bytes()),
            Bytes::from_static(self.kind.as_str().as_bytes()),
            Bytes::from(self.rid.clone()),
            Bytes::from(address.to_string()),
            Bytes::from(Value::Object(self.headers.clone()).to_string()),
            status,
            Bytes::from(self.payload.to_string()),
        ]
    }

    /// 从完整帧序列（含首部身份帧）解析信封。
    ///
    /// # 契约 (What)
    /// - 帧数必须恰为 8；协议帧必须等于 [`PROTOCOL`]；
    /// - 头部帧为空时视为空映射，负载帧为空时视为 `null`；
    /// - 任何一帧不满足编码要求都会返回对应的 [`EnvelopeError`]，不会部分构造。
    pub fn parse(frames: &[Bytes]) -> Result<Self, EnvelopeError> {
        if frames.len() != FRAME_COUNT {
            return Err(EnvelopeError::FrameCount {
                expected: FRAME_COUNT,
                actual: frames.len(),
            });
        }

        let identity = utf8(&frames[0], "identity")?;
        let protocol = utf8(&frames[1], "protocol")?;
        if protocol != PROTOCOL {
            return Err(EnvelopeError::Protocol(protocol.to_owned()));
        }
        let kind_raw = utf8(&frames[2], "type")?;
        let kind = MessageType::parse(kind_raw)
            .ok_or_else(|| EnvelopeError::MessageType(kind_raw.to_owned()))?;
        let rid = utf8(&frames[3], "rid")?;
        let address: Address = json(&frames[4], "address")?;
        // 空帧与 JSON `null` 都视为空头部。
        let headers: Headers = if frames[5].is_empty() {
            Headers::new()
        } else {
            json::<Option<Headers>>(&frames[5], "headers")?.unwrap_or_default()
        };
        let status_raw = utf8(&frames[6], "status")?;
        let status = if status_raw.is_empty() {
            None
        } else {
            Some(
                status_raw
                    .parse::<u16>()
                    .map_err(|_| EnvelopeError::Status(status_raw.to_owned()))?,
            )
        };
        let payload = if frames[7].is_empty() {
            Value::Null
        } else {
            json(&frames[7], "payload")?
        };

        Ok(Self {
            kind,
            address,
            rid: rid.to_owned(),
            identity: identity.to_owned(),
            headers,
            payload,
            status,
        })
    }
}

fn utf8<'a>(frame: &'a Bytes, name: &'static str) -> Result<&'a str, EnvelopeError> {
    std::str::from_utf8(frame).map_err(|_| EnvelopeError::Utf8 { frame: name })
}

fn json<T: serde::de::DeserializeOwned>(
    frame: &Bytes,
    name: &'static str,
) -> Result<T, EnvelopeError> {
    serde_json::from_slice(frame).map_err(|source| EnvelopeError::Json {
        frame: name,
        source,
    })
}

/// 帧序列无法解析为信封时的错误。
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("expected {expected} frames, got {actual}")]
    FrameCount { expected: usize, actual: usize },
    #[error("unsupported protocol `{0}`")]
    Protocol(String),
    #[error("unknown message type `{0}`")]
    MessageType(String),
    #[error("frame `{frame}` is not valid UTF-8")]
    Utf8 { frame: &'static str },
    #[error("invalid status `{0}`")]
    Status(String),
    #[error("frame `{frame}` is not valid JSON: {source}")]
    Json {
        frame: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl EnvelopeError {
    /// 稳定错误码，供日志聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            EnvelopeError::FrameCount { .. } => "zss.envelope.frame_count",
            EnvelopeError::Protocol(_) => "zss.envelope.protocol",
            EnvelopeError::MessageType(_) => "zss.envelope.message_type",
            EnvelopeError::Utf8 { .. } => "zss.envelope.utf8",
            EnvelopeError::Status(_) => "zss.envelope.status",
            EnvelopeError::Json { .. } => "zss.envelope.json",
        }
    }
}
