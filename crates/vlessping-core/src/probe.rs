//! 通过本地代理端口发出 HEAD 请求并测量往返延迟

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core_config::LOOPBACK;
use crate::error::{Error, Result};

/// 探测失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeFailureKind {
    Timeout,
    ConnectionFailed,
    ConnectionRefused,
    HostNotFound,
    Network,
}

impl ProbeFailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeFailureKind::Timeout => "timeout",
            ProbeFailureKind::ConnectionFailed => "connection failed",
            ProbeFailureKind::ConnectionRefused => "connection refused",
            ProbeFailureKind::HostNotFound => "host not found",
            ProbeFailureKind::Network => "network error",
        }
    }
}

impl fmt::Display for ProbeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 单次探测失败，不会中止运行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub kind: ProbeFailureKind,
    pub message: String,
}

impl ProbeFailure {
    /// 按错误文本中的子串分类
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_failure(&message),
            message,
        }
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// 按子串把底层错误文本归类
pub fn classify_failure(message: &str) -> ProbeFailureKind {
    let m = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&["timed out", "timeout", "etimedout"]) {
        ProbeFailureKind::Timeout
    } else if has(&["refused", "econnrefused"]) {
        ProbeFailureKind::ConnectionRefused
    } else if has(&["enotfound", "failed to lookup", "name or service not known", "no such host", "dns error", "nodename nor servname"]) {
        ProbeFailureKind::HostNotFound
    } else if has(&["connect", "econnreset", "reset by peer", "broken pipe"]) {
        ProbeFailureKind::ConnectionFailed
    } else {
        ProbeFailureKind::Network
    }
}

/// 一次探测
#[async_trait]
pub trait Probe: Send + Sync {
    /// 成功时返回往返时间
    async fn probe(&self) -> std::result::Result<Duration, ProbeFailure>;
}

/// 通过本地 HTTP 代理发 HEAD 请求
pub struct HttpProbe {
    client: reqwest::Client,
    target: String,
}

impl HttpProbe {
    pub fn new(local_port: u16, target: &str, timeout: Duration) -> Result<Self> {
        let proxy_url = format!("http://{}:{}", LOOPBACK, local_port);
        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| Error::Configuration(format!("invalid proxy url {}: {}", proxy_url, e)))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            client,
            target: target.to_string(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> std::result::Result<Duration, ProbeFailure> {
        let start = Instant::now();
        match self.client.head(&self.target).send().await {
            // 任何HTTP响应都算成功
            Ok(resp) => {
                let elapsed = start.elapsed();
                debug!("HEAD {} -> {} in {:?}", self.target, resp.status(), elapsed);
                Ok(elapsed)
            }
            Err(e) => {
                let message = error_chain(&e);
                debug!("HEAD {} failed: {}", self.target, message);
                if e.is_timeout() {
                    Err(ProbeFailure { kind: ProbeFailureKind::Timeout, message })
                } else {
                    Err(ProbeFailure::from_message(message))
                }
            }
        }
    }
}

/// 把错误及其 source 链拼成一行，分类需要看到底层原因
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        source = inner.source();
    }
    parts.join(": ")
}
