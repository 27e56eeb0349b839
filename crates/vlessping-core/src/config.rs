use serde::Deserialize;
use std::fs;
use std::path::Path;
use crate::error::{Error, Result};
use tracing::{debug, info, warn};

/// 代理核心路径的环境变量
pub const ENV_CORE_PATH: &str = "VLESSPING_CORE_PATH";
/// 探测目标URL的环境变量
pub const ENV_TARGET_URL: &str = "VLESSPING_TARGET_URL";
/// 分片参数的环境变量
pub const ENV_FRAGMENT_PACKETS: &str = "VLESSPING_FRAGMENT_PACKETS";
pub const ENV_FRAGMENT_LENGTH: &str = "VLESSPING_FRAGMENT_LENGTH";
pub const ENV_FRAGMENT_INTERVAL: &str = "VLESSPING_FRAGMENT_INTERVAL";

/// 默认的设置文件名（当前目录）
pub const DEFAULT_SETTINGS_FILE: &str = "vlessping.toml";

/// 主设置结构体
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Settings {
    /// 代理核心设置
    #[serde(default)]
    pub core: CoreSettings,
    /// 探测设置
    #[serde(default)]
    pub probe: ProbeSettings,
    /// 分片参数
    #[serde(default)]
    pub fragment: FragmentSettings,
    /// 启动检测设置
    #[serde(default)]
    pub startup: StartupSettings,
}

/// 代理核心设置
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CoreSettings {
    /// 可执行文件路径
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// 路径不可用时在 PATH 中查找的名称
    #[serde(default = "default_fallback_name")]
    pub fallback_name: String,
    /// 可用性检查参数
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
    /// 运行模式参数（配置从stdin读取）
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,
    /// 测试模式参数（配置从stdin读取）
    #[serde(default = "default_test_args")]
    pub test_args: Vec<String>,
    /// 配置校验超时（毫秒）
    #[serde(default = "default_validate_timeout_ms")]
    pub validate_timeout_ms: u64,
    /// 写入生成配置的日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 写入生成配置的DNS服务器
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,
}

fn default_binary_path() -> String { "./xray".to_string() }
fn default_fallback_name() -> String { "xray".to_string() }
fn default_version_args() -> Vec<String> { vec!["version".to_string()] }
fn default_run_args() -> Vec<String> {
    vec!["run".to_string(), "-config".to_string(), "stdin:".to_string()]
}
fn default_test_args() -> Vec<String> {
    vec!["run".to_string(), "-test".to_string(), "-config".to_string(), "stdin:".to_string()]
}
fn default_validate_timeout_ms() -> u64 { 10000 }
fn default_log_level() -> String { "warning".to_string() }
fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            fallback_name: default_fallback_name(),
            version_args: default_version_args(),
            run_args: default_run_args(),
            test_args: default_test_args(),
            validate_timeout_ms: default_validate_timeout_ms(),
            log_level: default_log_level(),
            dns_servers: default_dns_servers(),
        }
    }
}

/// 探测设置
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProbeSettings {
    /// HEAD 请求的目标
    #[serde(default = "default_target_url")]
    pub target_url: String,
}

fn default_target_url() -> String { "https://www.google.com/generate_204".to_string() }

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { target_url: default_target_url() }
    }
}

/// 分片参数
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FragmentSettings {
    #[serde(default = "default_fragment_packets")]
    pub packets: String,
    #[serde(default = "default_fragment_length")]
    pub length: String,
    #[serde(default = "default_fragment_interval")]
    pub interval: String,
}

fn default_fragment_packets() -> String { "tlshello".to_string() }
fn default_fragment_length() -> String { "100-200".to_string() }
fn default_fragment_interval() -> String { "10-20".to_string() }

impl Default for FragmentSettings {
    fn default() -> Self {
        Self {
            packets: default_fragment_packets(),
            length: default_fragment_length(),
            interval: default_fragment_interval(),
        }
    }
}

/// 启动检测设置
///
/// 就绪/失败子串与具体的核心版本和平台有关，所以放在设置里，可以被设置文件覆盖。
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StartupSettings {
    /// 轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 最大轮询次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// stdout 中表示就绪的子串
    #[serde(default = "default_ready_markers")]
    pub ready_markers: Vec<String>,
    /// stderr 中表示启动失败的子串
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,
}

fn default_poll_interval_ms() -> u64 { 100 }
fn default_max_attempts() -> u32 { 50 }
fn default_ready_markers() -> Vec<String> {
    vec![
        "Penetrates Everything".to_string(),
        "started".to_string(),
        "listening".to_string(),
    ]
}
fn default_failure_markers() -> Vec<String> {
    vec![
        "bind:".to_string(),
        "permission denied".to_string(),
        "failed to parse".to_string(),
        "error".to_string(),
    ]
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            ready_markers: default_ready_markers(),
            failure_markers: default_failure_markers(),
        }
    }
}

impl StartupSettings {
    /// 启动等待的总时长上限
    pub fn deadline_ms(&self) -> u64 {
        self.poll_interval_ms * u64::from(self.max_attempts)
    }
}

impl Settings {
    /// 从文件加载设置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("无法读取设置文件 {}: {}", path.display(), e);
                return Err(Error::Configuration(format!(
                    "cannot read settings file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let settings = toml::from_str::<Self>(&content)?;
        info!("设置已从 {} 加载", path.display());
        Ok(settings)
    }

    /// 加载设置：显式路径必须存在；否则尝试当前目录的默认文件，再退回内置默认值
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_SETTINGS_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    debug!("没有设置文件，使用默认设置");
                    Ok(Self::default())
                }
            }
        }
    }

    /// 用进程环境变量覆盖设置
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// 用给定的查找函数覆盖设置，空值忽略
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_CORE_PATH) {
            self.core.binary_path = path;
        }
        if let Some(url) = get(ENV_TARGET_URL) {
            self.probe.target_url = url;
        }
        if let Some(packets) = get(ENV_FRAGMENT_PACKETS) {
            self.fragment.packets = packets;
        }
        if let Some(length) = get(ENV_FRAGMENT_LENGTH) {
            self.fragment.length = length;
        }
        if let Some(interval) = get(ENV_FRAGMENT_INTERVAL) {
            self.fragment.interval = interval;
        }
    }
}
