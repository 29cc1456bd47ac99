//! 响应归类：把 `(status, payload)` 映射为成功或失败。
//!
//! # 规则（What）
//! 1. `status ∈ [200, 300)`：成功，负载、头部与状态原样交付；
//! 2. 否则若负载满足错误描述契约（[`is_error_descriptor`]）：失败，上游描述原样透传；
//! 3. 否则：失败，使用目录中该状态码的条目，未登记时回退到 500。
//!
//! `[200, 600)` 之外的状态码没有专属语义，统一走第 3 条。

use super::{ErrorCatalog, ErrorDescriptor};
use crate::{client::Reply, envelope::Envelope};
use serde_json::Value;

/// 状态码所属的结果类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    ClientError,
    ServerError,
    Unrecognized,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => StatusClass::Success,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unrecognized,
        }
    }

    /// 是否属于合法的错误码区间 `[400, 600)`。
    pub fn is_error(&self) -> bool {
        matches!(self, StatusClass::ClientError | StatusClass::ServerError)
    }
}

/// 判断负载是否为结构良好的错误描述：对象中含有整数 `code` 且位于 `[400, 600)`。
///
/// 只检查 `code`，不要求文案字段存在；文案缺失时透传后为空串。
pub fn is_error_descriptor(payload: &Value) -> bool {
    payload
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .is_some_and(|code| StatusClass::of(code).is_error())
}

/// 对已完成追踪打点的响应进行归类。
///
/// # 教案式说明
/// - **意图 (Why)**：上游服务对自身错误最了解，其描述应被信任；
///   只有缺失或畸形的描述才用目录中的通用文案替换，避免把半截结构暴露给调用方。
/// - **契约 (What)**：缺少状态码的响应按“未识别”处理，落入目录回退路径。
pub fn classify(reply: Envelope, catalog: &ErrorCatalog) -> Result<Reply, ErrorDescriptor> {
    let Envelope {
        status,
        payload,
        headers,
        ..
    } = reply;

    match status {
        Some(code) if StatusClass::of(code) == StatusClass::Success => Ok(Reply {
            status: code,
            payload,
            headers,
        }),
        _ if is_error_descriptor(&payload) => Err(serde_json::from_value::<ErrorDescriptor>(
            payload,
        )
        .unwrap_or_else(|_| fallback(status, catalog))),
        _ => Err(fallback(status, catalog)),
    }
}

fn fallback(status: Option<u16>, catalog: &ErrorCatalog) -> ErrorDescriptor {
    match status {
        Some(code) => catalog.resolve(code),
        None => catalog.internal(),
    }
}
