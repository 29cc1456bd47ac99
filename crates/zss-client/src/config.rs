//! 客户端配置与单次调用选项。
//!
//! # 设计动机（Why）
//! - 配置是构造期注入的不可变值对象，客户端实例之间互不影响；
//! - 单次调用可以通过 [`CallOptions`] 覆盖服务标识、截止时间并追加头部，
//!   合并结果只在本次调用内生效。
//!
//! # 契约说明（What）
//! - `broker`、`sid` 必填；`identity` 缺省为 `"client"`，`timeout` 缺省为 1000 毫秒；
//! - 头部按键合并，调用级头部覆盖配置级同名键；
//! - [`ClientConfig::validate`] 拒绝空字段与零超时。

use crate::envelope::Headers;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// 缺省身份前缀。
pub const DEFAULT_IDENTITY: &str = "client";

/// 缺省单次调用截止时间。
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// 客户端实例配置。
///
/// TOML 示例：
///
/// ```toml
/// broker = "tcp://127.0.0.1:7777"
/// sid = "user-service"
/// identity = "gateway"
/// timeout = 2500
///
/// [headers]
/// tenant = "acme"
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    broker: String,
    sid: String,
    #[serde(default = "default_identity")]
    identity: String,
    #[serde(default = "default_timeout", with = "millis")]
    timeout: Duration,
    #[serde(default)]
    headers: Headers,
}

impl ClientConfig {
    pub fn new(broker: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            sid: sid.into(),
            identity: default_identity(),
            timeout: DEFAULT_TIMEOUT,
            headers: Headers::new(),
        }
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 校验必填字段与取值范围。
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("broker", &self.broker),
            ("sid", &self.sid),
            ("identity", &self.identity),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(field));
            }
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// 将调用选项叠加到实例配置上，得到本次调用的有效参数。
    pub(crate) fn resolve(&self, options: CallOptions) -> ResolvedCall {
        let mut headers = self.headers.clone();
        headers.extend(options.headers);
        ResolvedCall {
            sid: options.sid.unwrap_or_else(|| self.sid.clone()),
            timeout: options.timeout.unwrap_or(self.timeout),
            headers,
        }
    }
}

/// 单次调用的覆盖项，全部可选。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallOptions {
    pub sid: Option<String>,
    pub timeout: Option<Duration>,
    pub headers: Headers,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// 合并后的调用参数。
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ResolvedCall {
    pub(crate) sid: String,
    pub(crate) timeout: Duration,
    pub(crate) headers: Headers,
}

/// 配置非法。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration field `{0}` must not be empty")]
    MissingField(&'static str),
    #[error("call timeout must be greater than zero")]
    ZeroTimeout,
    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

fn default_identity() -> String {
    DEFAULT_IDENTITY.to_owned()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
