use std::io;

/// Error type for vlessping operations
///
/// 除 `Io`/`Configuration`/`Serialization` 外，每个变体都是一次运行的致命错误。
/// 单次探测失败不在这里，见 [`crate::probe::ProbeFailure`]。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 找不到代理核心可执行文件
    #[error("Proxy core binary not found (tried: {0})")]
    BinaryNotFound(String),
    /// vless:// 链接格式错误
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),
    /// 既不是链接也不是存在的文件
    #[error("Input is neither a vless:// link nor an existing file: {0}")]
    InputNotRecognized(String),
    /// 配置文件中没有可用的代理出站
    #[error("No vless/vmess/trojan outbound found in {0}")]
    NoProxyOutbound(String),
    /// 配置文件不是合法JSON
    #[error("Invalid JSON in {path}: {source}")]
    InvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// 代理核心拒绝了生成的配置
    #[error("Config validation failed: {0}")]
    ConfigValidationFailed(String),
    /// 启动失败（无法创建进程，或启动期间输出致命错误）
    #[error("Proxy core failed to launch: {0}")]
    ProcessLaunchFailed(String),
    /// 进程在就绪前（或运行中）退出
    #[error("Proxy core exited unexpectedly (exit code {}): {detail}", code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ProcessExitedEarly { code: Option<i32>, detail: String },
    /// 启动超时
    #[error("Proxy core did not become ready within {waited_ms}ms: {detail}")]
    StartupTimeout { waited_ms: u64, detail: String },
    /// IO操作错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for vlessping operations
pub type Result<T> = std::result::Result<T, Error>;

/// 从toml错误转换
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
