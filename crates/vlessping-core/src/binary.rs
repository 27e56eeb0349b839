//! 代理核心可执行文件：可用性检查与配置校验

use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::CoreSettings;
use crate::core_config::ProxyConfigDocument;
use crate::error::{Error, Result};

/// 校验失败且没有任何输出时的提示
pub const NO_VALIDATION_OUTPUT: &str = "no output from config test";

/// 已确认可以调用的代理核心
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreBinary {
    /// 实际使用的程序（路径或裸名称）
    pub program: String,
    /// 版本输出的第一行
    pub version: Option<String>,
}

/// 查找代理核心：先试配置的路径，再试 PATH 里的裸名称
///
/// 都不可用时返回 None，这不是错误。
pub async fn locate(core: &CoreSettings) -> Option<CoreBinary> {
    let mut candidates = vec![core.binary_path.clone()];
    if core.fallback_name != core.binary_path {
        candidates.push(core.fallback_name.clone());
    }

    for program in candidates {
        match Command::new(&program)
            .args(&core.version_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .map(str::to_string);
                debug!("找到代理核心 {} ({:?})", program, version);
                return Some(CoreBinary { program, version });
            }
            Ok(output) => debug!("{} 退出码 {:?}，跳过", program, output.status.code()),
            Err(e) => debug!("无法执行 {}: {}", program, e),
        }
    }
    None
}

/// 候选程序列表，用于 BinaryNotFound 的提示
pub fn candidates_display(core: &CoreSettings) -> String {
    if core.fallback_name == core.binary_path {
        core.binary_path.clone()
    } else {
        format!("{}, {}", core.binary_path, core.fallback_name)
    }
}

/// 用测试模式校验配置，配置通过 stdin 传入
pub async fn validate(
    binary: &CoreBinary,
    core: &CoreSettings,
    document: &ProxyConfigDocument,
) -> Result<()> {
    let text = document.to_json_string()?;
    debug!("校验配置: {} {:?}", binary.program, core.test_args);

    let mut child = Command::new(&binary.program)
        .args(&core.test_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::ConfigValidationFailed(format!("cannot run {}: {}", binary.program, e)))?;

    // 写入与等待并发，共用一个时限；超时后 child 被丢弃并终止
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // 进程可能不读stdin就退出，写入失败只记录
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                warn!("写入配置到校验进程失败: {}", e);
            }
        }
    };
    let run = async move {
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    let limit = Duration::from_millis(core.validate_timeout_ms);
    let output = match timeout(limit, run).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(Error::ConfigValidationFailed(format!(
                "config test did not finish within {}ms",
                core.validate_timeout_ms
            )))
        }
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(Error::ConfigValidationFailed(validation_message(&stderr, &stdout)))
}

/// 第一条非空的 stderr 行，其次 stdout，最后固定提示
pub fn validation_message(stderr: &str, stdout: &str) -> String {
    first_line(stderr)
        .or_else(|| first_line(stdout))
        .unwrap_or(NO_VALIDATION_OUTPUT)
        .to_string()
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}
