//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 调用失败对调用方只暴露一种形态：[`ErrorDescriptor`]，即 `{code, userMessage, developerMessage}`；
//! - 状态码到描述的映射集中在不可变的 [`ErrorCatalog`] 中，由构造方显式注入，不存在进程级可变单例；
//! - [`classify`] 子模块负责把响应状态与负载归类为成功或失败。
//!
//! ## 设计要求（What）
//! - 目录必须包含通用服务端错误（500）与内部超时（599）两项，否则拒绝构造；
//! - 未登记的状态码统一回退到 500；
//! - 599 专属于截止时间到期，上游服务不应产生该码。

pub mod classify;

pub use classify::{StatusClass, classify, is_error_descriptor};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// 参数非法。空动词等前置条件失败时使用。
pub const BAD_REQUEST: u16 = 400;
/// 通用服务端错误，也是未登记状态码与传输失败的回退项。
pub const INTERNAL_ERROR: u16 = 500;
/// 截止时间到期的保留码。
pub const TIMEOUT: u16 = 599;

/// 调用失败时交付给调用方的错误描述。
///
/// # 教案式说明
/// - **意图 (Why)**：上游服务自行构造的描述需要原样透传，而客户端合成的描述来自目录；
///   两者共享同一结构，调用方无需区分来源。
/// - **契约 (What)**：
///   - 序列化字段名为 `code`/`userMessage`/`developerMessage`；
///   - 上游描述中的额外字段保存在 `extra` 中，透传时不丢失；
///   - 实现 [`std::error::Error`]，可直接作为 `Result` 的错误类型与 `?` 协作。
/// - **风险 (Trade-offs)**：`user_message`/`developer_message` 缺省为空串，
///   以便接受只带 `code` 的上游描述；展示层需自行兜底空文案。
///   空串等同于“未提供”，[`to_payload`](Self::to_payload) 不会把它写回线上负载。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {developer_message}")]
pub struct ErrorDescriptor {
    pub code: u16,
    #[serde(default)]
    pub user_message: String,
    #[serde(default)]
    pub developer_message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ErrorDescriptor {
    pub fn new(
        code: u16,
        user_message: impl Into<String>,
        developer_message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            user_message: user_message.into(),
            developer_message: developer_message.into(),
            extra: Map::new(),
        }
    }

    /// 转为线上负载形态；空文案字段省略。
    pub fn to_payload(&self) -> Value {
        let mut object = self.extra.clone();
        object.insert("code".into(), Value::from(self.code));
        if !self.user_message.is_empty() {
            object.insert("userMessage".into(), Value::from(self.user_message.clone()));
        }
        if !self.developer_message.is_empty() {
            object.insert(
                "developerMessage".into(),
                Value::from(self.developer_message.clone()),
            );
        }
        Value::Object(object)
    }

    pub fn status_class(&self) -> StatusClass {
        StatusClass::of(self.code)
    }
}

/// 状态码到错误描述的只读目录。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 以值对象取代全局可变表：客户端在构造时持有一份 `Arc<ErrorCatalog>`，
///   测试可以注入自定义目录而不影响其他实例。
///
/// ## 契约 (What)
/// - [`ErrorCatalog::default`] 提供内置条目：400、401、403、404、405、408、500、501、502、503、504、599；
/// - [`ErrorCatalog::from_entries`] 与 [`ErrorCatalog::from_json_str`] 校验 500/599 必须存在，
///   且每个条目的 `code` 与其键一致；
/// - [`resolve`](Self::resolve) 永不失败：未登记的码回退到 500。
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorCatalog {
    entries: BTreeMap<u16, ErrorDescriptor>,
}

impl ErrorCatalog {
    /// 由条目集合构造目录。
    pub fn from_entries(
        entries: impl IntoIterator<Item = ErrorDescriptor>,
    ) -> Result<Self, CatalogError> {
        let entries: BTreeMap<u16, ErrorDescriptor> = entries
            .into_iter()
            .map(|entry| (entry.code, entry))
            .collect();
        for required in [INTERNAL_ERROR, TIMEOUT] {
            if !entries.contains_key(&required) {
                return Err(CatalogError::MissingEntry(required));
            }
        }
        Ok(Self { entries })
    }

    /// 从 JSON 文本加载目录，格式为 `{"404": {"code": 404, "userMessage": ..., ...}, ...}`。
    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let table: BTreeMap<String, ErrorDescriptor> = serde_json::from_str(raw)?;
        let mut entries = Vec::with_capacity(table.len());
        for (key, entry) in table {
            let code = key
                .parse::<u16>()
                .map_err(|_| CatalogError::InvalidKey(key.clone()))?;
            if code != entry.code {
                return Err(CatalogError::CodeMismatch {
                    key: code,
                    code: entry.code,
                });
            }
            entries.push(entry);
        }
        Self::from_entries(entries)
    }

    /// 精确查找，不做回退。
    pub fn lookup(&self, code: u16) -> Option<&ErrorDescriptor> {
        self.entries.get(&code)
    }

    /// 查找并在未命中时回退到 500。
    pub fn resolve(&self, code: u16) -> ErrorDescriptor {
        self.lookup(code)
            .cloned()
            .unwrap_or_else(|| self.internal())
    }

    /// 通用服务端错误描述。
    pub fn internal(&self) -> ErrorDescriptor {
        self.lookup(INTERNAL_ERROR).cloned().unwrap_or_else(|| {
            ErrorDescriptor::new(
                INTERNAL_ERROR,
                "Internal Server Error",
                "The server encountered an unexpected condition",
            )
        })
    }

    /// 截止时间到期描述。
    pub fn timeout(&self) -> ErrorDescriptor {
        self.lookup(TIMEOUT).cloned().unwrap_or_else(|| {
            ErrorDescriptor::new(TIMEOUT, "Request Timeout", "The call deadline expired")
        })
    }

    pub fn bad_request(&self) -> ErrorDescriptor {
        self.resolve(BAD_REQUEST)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ErrorCatalog {
    fn default() -> Self {
        let entries = [
            (400, "Bad Request", "The request could not be understood by the service"),
            (401, "Unauthorized", "The request requires user authentication"),
            (403, "Forbidden", "The service understood the request but refuses to fulfill it"),
            (404, "Not Found", "The requested verb or resource was not found"),
            (405, "Method Not Allowed", "The verb is not allowed for the requested resource"),
            (408, "Request Timeout", "The service did not receive a complete request in time"),
            (500, "Internal Server Error", "There was an error processing your request"),
            (501, "Not Implemented", "The service does not support the requested verb"),
            (502, "Bad Gateway", "The broker received an invalid response from the service"),
            (503, "Service Unavailable", "No worker is currently available for the service"),
            (504, "Gateway Timeout", "The broker did not receive a timely response from the service"),
            (599, "Service Timeout", "The call did not receive a reply before its deadline"),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(code, user, developer)| (code, ErrorDescriptor::new(code, user, developer)))
                .collect(),
        }
    }
}

/// 目录加载失败。
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("error catalog must contain an entry for {0}")]
    MissingEntry(u16),
    #[error("catalog key `{0}` is not a status code")]
    InvalidKey(String),
    #[error("catalog key {key} holds an entry with code {code}")]
    CodeMismatch { key: u16, code: u16 },
    #[error("invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
}
