//! 代理核心进程的启动与监督
//!
//! 进程的 stdout/stderr 由两个读取任务逐行转发到通道，读取任务不做任何判断；
//! 所有日志和状态标志都由 [`ProcessSession`] 在主流程中处理。

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::binary::CoreBinary;
use crate::config::{CoreSettings, StartupSettings};
use crate::core_config::ProxyConfigDocument;
use crate::error::{Error, Result};
use crate::event::{Event, Reporter};

/// 没有任何输出时的诊断信息
pub const NO_OUTPUT: &str = "no output from proxy core";

/// 诊断信息最多带的行数
const DIAGNOSTIC_LINES: usize = 5;

/// 进程退出后等待剩余输出的时间
const OUTPUT_FLUSH_GRACE: Duration = Duration::from_millis(200);

/// 输出来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// 单行输出的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineVerdict {
    /// 表示已就绪
    Ready,
    /// 表示启动失败
    Fatal,
    /// 普通输出
    Neutral,
}

/// 就绪/失败子串，不区分大小写
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    ready: Vec<String>,
    failure: Vec<String>,
}

impl Markers {
    pub fn new<I, J, S, T>(ready: I, failure: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let lower = |s: &str| s.to_lowercase();
        Self {
            ready: ready.into_iter().map(|s| lower(s.as_ref())).filter(|s| !s.is_empty()).collect(),
            failure: failure.into_iter().map(|s| lower(s.as_ref())).filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn from_settings(startup: &StartupSettings) -> Self {
        Self::new(&startup.ready_markers, &startup.failure_markers)
    }

    /// 就绪子串只在 stdout 中查找，失败子串只在 stderr 中查找
    pub fn classify(&self, stream: OutputStream, line: &str) -> LineVerdict {
        let line = line.to_lowercase();
        let markers = match stream {
            OutputStream::Stdout => &self.ready,
            OutputStream::Stderr => &self.failure,
        };
        if !markers.iter().any(|m| line.contains(m.as_str())) {
            return LineVerdict::Neutral;
        }
        match stream {
            OutputStream::Stdout => LineVerdict::Ready,
            OutputStream::Stderr => LineVerdict::Fatal,
        }
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Started,
    Failed,
    Exited,
}

/// 运行中的代理核心进程
pub struct ProcessSession {
    child: Child,
    lines: mpsc::UnboundedReceiver<(OutputStream, String)>,
    markers: Markers,
    started: bool,
    errored: bool,
    exited: bool,
    exit_code: Option<i32>,
    fatal_line: Option<String>,
    stdout_log: Vec<String>,
    stderr_log: Vec<String>,
}

impl ProcessSession {
    /// 以运行模式启动代理核心，写入配置后关闭 stdin
    pub async fn spawn(
        binary: &CoreBinary,
        core: &CoreSettings,
        document: &ProxyConfigDocument,
        markers: Markers,
    ) -> Result<Self> {
        let text = document.to_json_string()?;
        debug!("启动代理核心: {} {:?}", binary.program, core.run_args);

        let mut child = Command::new(&binary.program)
            .args(&core.run_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProcessLaunchFailed(format!("cannot spawn {}: {}", binary.program, e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, tx);
        }

        if let Some(mut stdin) = child.stdin.take() {
            // 进程不读 stdin 时写入会阻塞，在独立任务中进行
            tokio::spawn(async move {
                // 写入失败通常意味着进程已经退出，交给退出检测处理
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    warn!("写入配置到代理核心失败: {}", e);
                }
            });
        }

        info!("代理核心已启动, pid {:?}", child.id());
        Ok(Self {
            child,
            lines: rx,
            markers,
            started: false,
            errored: false,
            exited: false,
            exit_code: None,
            fatal_line: None,
            stdout_log: Vec::new(),
            stderr_log: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        if self.errored || (self.exited && !self.started) {
            SessionState::Failed
        } else if self.exited {
            SessionState::Exited
        } else if self.started {
            SessionState::Started
        } else {
            SessionState::Starting
        }
    }

    pub fn stdout_log(&self) -> &[String] {
        &self.stdout_log
    }

    pub fn stderr_log(&self) -> &[String] {
        &self.stderr_log
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// 处理通道中已到达的全部输出
    pub fn drain<R: Reporter + ?Sized>(&mut self, reporter: &mut R) {
        while let Ok((stream, line)) = self.lines.try_recv() {
            self.ingest(stream, line, reporter);
        }
    }

    fn ingest<R: Reporter + ?Sized>(&mut self, stream: OutputStream, line: String, reporter: &mut R) {
        debug!(target: "vlessping::core_output", "[{:?}] {}", stream, line);
        let verdict = self.markers.classify(stream, &line);
        match stream {
            OutputStream::Stdout => self.stdout_log.push(line.clone()),
            OutputStream::Stderr => self.stderr_log.push(line.clone()),
        }
        reporter.report(Event::CoreOutput { stream, line: line.clone() });

        match verdict {
            LineVerdict::Ready if !self.started && !self.errored => {
                info!("代理核心就绪: {}", line);
                self.started = true;
            }
            LineVerdict::Fatal if !self.started => {
                if !self.errored {
                    self.errored = true;
                    self.fatal_line = Some(line.clone());
                }
                reporter.report(Event::CoreFatalLine(line));
            }
            LineVerdict::Fatal => reporter.report(Event::CoreWarning(line)),
            _ => {}
        }
    }

    /// 进程退出后收集读取任务尚未转发的输出
    async fn flush_output<R: Reporter + ?Sized>(&mut self, reporter: &mut R) {
        let deadline = Instant::now() + OUTPUT_FLUSH_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.lines.recv()).await {
                Ok(Some((stream, line))) => self.ingest(stream, line, reporter),
                _ => break,
            }
        }
    }

    fn poll_exit(&mut self) -> Result<bool> {
        if !self.exited {
            if let Some(status) = self.child.try_wait()? {
                debug!("代理核心已退出: {:?}", status);
                self.exited = true;
                self.exit_code = status.code();
            }
        }
        Ok(self.exited)
    }

    /// 轮询直到就绪、失败、退出或超时
    pub async fn wait_until_ready<R: Reporter + ?Sized>(
        &mut self,
        startup: &StartupSettings,
        reporter: &mut R,
    ) -> Result<()> {
        let interval = Duration::from_millis(startup.poll_interval_ms);
        for _ in 0..startup.max_attempts {
            sleep(interval).await;
            self.drain(reporter);
            if self.poll_exit()? {
                self.flush_output(reporter).await;
            }

            if self.errored {
                self.kill().await;
                let line = self.fatal_line.clone().unwrap_or_else(|| self.best_diagnostic());
                return Err(Error::ProcessLaunchFailed(line));
            }
            if self.exited {
                return Err(Error::ProcessExitedEarly {
                    code: self.exit_code,
                    detail: self.best_diagnostic(),
                });
            }
            if self.started {
                return Ok(());
            }
        }

        self.kill().await;
        Err(Error::StartupTimeout {
            waited_ms: startup.deadline_ms(),
            detail: self.best_diagnostic(),
        })
    }

    /// 运行中检查进程是否仍然存活；任何时候退出都是致命的
    pub fn check_alive<R: Reporter + ?Sized>(&mut self, reporter: &mut R) -> Result<()> {
        self.drain(reporter);
        if self.poll_exit()? {
            return Err(Error::ProcessExitedEarly {
                code: self.exit_code,
                detail: self.best_diagnostic(),
            });
        }
        Ok(())
    }

    /// stderr 的最后几行，其次 stdout，最后固定提示
    pub fn best_diagnostic(&self) -> String {
        tail(&self.stderr_log)
            .or_else(|| tail(&self.stdout_log))
            .unwrap_or_else(|| NO_OUTPUT.to_string())
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("终止代理核心: {}", e);
        }
        self.exited = true;
    }

    /// 终止进程并回收，返回退出码（被信号终止时为 None）
    pub async fn shutdown(mut self) -> Option<i32> {
        if !self.exited {
            if let Err(e) = self.child.start_kill() {
                debug!("终止代理核心: {}", e);
            }
        }
        match self.child.wait().await {
            Ok(status) => {
                info!("代理核心已终止: {:?}", status);
                status.code().or(self.exit_code)
            }
            Err(e) => {
                warn!("回收代理核心进程失败: {}", e);
                self.exit_code
            }
        }
    }
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    });
}

fn tail(log: &[String]) -> Option<String> {
    let lines: Vec<&str> = log
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    Some(lines[start..].join("\n"))
}
