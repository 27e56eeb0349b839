//! 一次运行的完整流程：解析输入、生成配置、校验、启动核心、探测循环、清理

use chrono::Local;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::binary::{self, CoreBinary};
use crate::config::Settings;
use crate::core_config::{self, FragmentInfo, ProxyConfigDocument};
use crate::descriptor::{self, ConnectionDescriptor, DerivedInput, Provenance};
use crate::error::{Error, Result};
use crate::event::{Event, Reporter};
use crate::probe::{HttpProbe, Probe};
use crate::stats::PingStatistics;
use crate::supervisor::{Markers, ProcessSession};

/// 每次运行的选项（来自命令行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// 链接或配置文件路径
    pub input: String,
    /// 是否启用分片
    pub fragment: bool,
    /// 两次探测之间的间隔
    pub delay: Duration,
    /// 单次探测超时
    pub timeout: Duration,
    /// 探测次数，None 表示不限
    pub count: Option<u64>,
}

impl RunOptions {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            fragment: false,
            delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(5000),
            count: None,
        }
    }
}

/// 运行结果（致命错误走 `Err`）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// 达到探测次数
    Completed(PingStatistics),
    /// 被中断信号结束
    Interrupted(PingStatistics),
}

impl RunOutcome {
    pub fn statistics(&self) -> &PingStatistics {
        match self {
            RunOutcome::Completed(stats) | RunOutcome::Interrupted(stats) => stats,
        }
    }
}

/// 探测循环的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    Completed,
    Interrupted,
}

/// 探测结果中显示的目标信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub address: String,
    pub label: String,
}

impl From<&ConnectionDescriptor> for ProbeTarget {
    fn from(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            address: descriptor.endpoint(),
            label: descriptor.label.clone(),
        }
    }
}

/// 探测循环
///
/// 每次迭代前调用 `alive` 检查核心进程；中断时正在进行的探测被放弃，不计入统计。
pub async fn probe_loop<P, R, F>(
    probe: &P,
    target: &ProbeTarget,
    count: Option<u64>,
    delay: Duration,
    stats: &mut PingStatistics,
    cancel: &CancellationToken,
    reporter: &mut R,
    mut alive: F,
) -> Result<LoopEnd>
where
    P: Probe + ?Sized,
    R: Reporter + ?Sized,
    F: FnMut(&mut R) -> Result<()>,
{
    let mut seq: u64 = 0;
    loop {
        if count.is_some_and(|n| seq >= n) {
            return Ok(LoopEnd::Completed);
        }
        if cancel.is_cancelled() {
            return Ok(LoopEnd::Interrupted);
        }
        alive(reporter)?;

        seq += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(LoopEnd::Interrupted),
            result = probe.probe() => result,
        };

        let at = Local::now();
        match result {
            Ok(elapsed) => {
                let latency_ms = elapsed.as_millis() as u64;
                stats.record_success(latency_ms);
                reporter.report(Event::ProbeSucceeded {
                    seq,
                    at,
                    address: target.address.clone(),
                    label: target.label.clone(),
                    latency_ms,
                });
            }
            Err(failure) => {
                debug!("第{}次探测失败: {}", seq, failure);
                stats.record_failure();
                reporter.report(Event::ProbeFailed {
                    seq,
                    at,
                    address: target.address.clone(),
                    label: target.label.clone(),
                    kind: failure.kind,
                });
            }
        }

        let last = count.is_some_and(|n| seq >= n);
        if !last && !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(LoopEnd::Interrupted),
                _ = sleep(delay) => {}
            }
        }
    }
}

/// 一次运行的上下文，拥有核心进程和统计
pub struct RunContext<R: Reporter> {
    settings: Settings,
    options: RunOptions,
    reporter: R,
    cancel: CancellationToken,
    session: Option<ProcessSession>,
    stats: PingStatistics,
}

impl<R: Reporter> RunContext<R> {
    pub fn new(settings: Settings, options: RunOptions, reporter: R, cancel: CancellationToken) -> Self {
        Self {
            settings,
            options,
            reporter,
            cancel,
            session: None,
            stats: PingStatistics::new(),
        }
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn into_reporter(self) -> R {
        self.reporter
    }

    /// 执行一次运行；无论结果如何，返回前核心进程都已终止
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let result = self.run_inner().await;

        // 汇总先于清理
        let summary_due = match &result {
            Ok(_) => true,
            Err(Error::ProcessExitedEarly { .. }) => self.stats.attempted() > 0,
            Err(_) => false,
        };
        if summary_due {
            self.reporter.report(Event::Summary(self.stats.summary()));
        }
        self.teardown().await;
        result
    }

    async fn run_inner(&mut self) -> Result<RunOutcome> {
        let DerivedInput { descriptor, provenance, document } = descriptor::derive(&self.options.input)?;
        self.reporter.report(Event::InputDerived {
            descriptor: descriptor.clone(),
            provenance,
        });

        let binary = binary::locate(&self.settings.core)
            .await
            .ok_or_else(|| Error::BinaryNotFound(binary::candidates_display(&self.settings.core)))?;
        self.reporter.report(Event::BinaryFound {
            program: binary.program.clone(),
            version: binary.version.clone(),
        });

        let port = core_config::free_port().await?;
        self.reporter.report(Event::PortAllocated(port));

        let config = self.build_document(&descriptor, provenance, document.as_ref(), port);
        binary::validate(&binary, &self.settings.core, &config).await?;
        self.reporter.report(Event::ConfigValid);

        // 查找或校验期间已收到中断，不再启动核心
        if self.cancel.is_cancelled() {
            info!("启动前收到中断");
            self.reporter.report(Event::Interrupted);
            return Ok(RunOutcome::Interrupted(self.stats.clone()));
        }

        if !self.start_core(&binary, &config).await? {
            self.reporter.report(Event::Interrupted);
            return Ok(RunOutcome::Interrupted(self.stats.clone()));
        }
        self.reporter.report(Event::CoreReady { port });

        let probe = HttpProbe::new(port, &self.settings.probe.target_url, self.options.timeout)?;
        let target = ProbeTarget::from(&descriptor);
        let end = {
            let Self { session, stats, reporter, cancel, options, .. } = self;
            let session = session
                .as_mut()
                .ok_or_else(|| Error::ProcessLaunchFailed("session missing after startup".to_string()))?;
            probe_loop(
                &probe,
                &target,
                options.count,
                options.delay,
                stats,
                cancel,
                reporter,
                |r| session.check_alive(r),
            )
            .await?
        };

        match end {
            LoopEnd::Completed => Ok(RunOutcome::Completed(self.stats.clone())),
            LoopEnd::Interrupted => {
                self.reporter.report(Event::Interrupted);
                Ok(RunOutcome::Interrupted(self.stats.clone()))
            }
        }
    }

    fn build_document(
        &mut self,
        descriptor: &ConnectionDescriptor,
        provenance: Provenance,
        document: Option<&serde_json::Value>,
        port: u16,
    ) -> ProxyConfigDocument {
        match (provenance, document) {
            (Provenance::ExistingConfig, Some(original)) => {
                if let Some(info) = core_config::detect_fragment(original) {
                    self.reporter.report(Event::FragmentDetected(info));
                }
                if self.options.fragment {
                    self.reporter.report(Event::FragmentFlagIgnored);
                }
                core_config::patch_inbounds(original, port)
            }
            _ => {
                let fragment = self.options.fragment.then_some(&self.settings.fragment);
                if let Some(settings) = fragment {
                    self.reporter.report(Event::FragmentEnabled(FragmentInfo::from(settings)));
                }
                core_config::synthesize(descriptor, fragment, port, &self.settings.core)
            }
        }
    }

    /// 启动并等待就绪；被中断时返回 false
    async fn start_core(&mut self, binary: &CoreBinary, config: &ProxyConfigDocument) -> Result<bool> {
        self.reporter.report(Event::CoreStarting);
        let markers = Markers::from_settings(&self.settings.startup);
        let session = ProcessSession::spawn(binary, &self.settings.core, config, markers).await?;
        let session = self.session.insert(session);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("启动等待期间收到中断");
                Ok(false)
            }
            ready = session.wait_until_ready(&self.settings.startup, &mut self.reporter) => {
                ready.map(|_| true)
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            let exit_code = session.shutdown().await;
            self.reporter.report(Event::CoreStopped { exit_code });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventLog;
    use crate::probe::{ProbeFailure, ProbeFailureKind};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按脚本返回结果的探测；脚本用完后取消令牌并挂起
    struct ScriptedProbe {
        script: Mutex<VecDeque<std::result::Result<u64, ProbeFailureKind>>>,
        cancel: CancellationToken,
        calls: Mutex<u64>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<std::result::Result<u64, ProbeFailureKind>>, cancel: CancellationToken) -> Self {
            Self {
                script: Mutex::new(script.into()),
                cancel,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u64 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self) -> std::result::Result<Duration, ProbeFailure> {
            *self.calls.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(ms)) => Ok(Duration::from_millis(ms)),
                Some(Err(kind)) => Err(ProbeFailure { kind, message: kind.label().to_string() }),
                None => {
                    self.cancel.cancel();
                    std::future::pending().await
                }
            }
        }
    }

    fn target() -> ProbeTarget {
        ProbeTarget { address: "host1:443".to_string(), label: "label1".to_string() }
    }

    #[tokio::test]
    async fn counted_loop_with_all_successes() {
        let cancel = CancellationToken::new();
        let probe = ScriptedProbe::new(vec![Ok(100), Ok(150), Ok(200)], cancel.clone());
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();

        let end = probe_loop(&probe, &target(), Some(3), Duration::ZERO, &mut stats, &cancel, &mut log, |_| Ok(()))
            .await
            .unwrap();

        assert_eq!(end, LoopEnd::Completed);
        assert_eq!(probe.calls(), 3);
        let summary = stats.summary();
        assert_eq!((summary.sent, summary.received, summary.lost, summary.loss_percent), (3, 3, 0, 0));
        let latency = summary.latency.unwrap();
        assert_eq!((latency.min_ms, latency.max_ms, latency.avg_ms), (100, 200, 150));

        let latencies: Vec<u64> = log
            .events
            .iter()
            .filter_map(|e| match e {
                Event::ProbeSucceeded { latency_ms, label, address, .. } => {
                    assert_eq!(label, "label1");
                    assert_eq!(address, "host1:443");
                    Some(*latency_ms)
                }
                _ => None,
            })
            .collect();
        assert_eq!(latencies, vec![100, 150, 200]);
    }

    #[tokio::test]
    async fn failures_are_counted_and_classified() {
        let cancel = CancellationToken::new();
        let probe = ScriptedProbe::new(
            vec![Err(ProbeFailureKind::Timeout), Ok(80), Err(ProbeFailureKind::HostNotFound)],
            cancel.clone(),
        );
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();

        probe_loop(&probe, &target(), Some(3), Duration::ZERO, &mut stats, &cancel, &mut log, |_| Ok(()))
            .await
            .unwrap();

        assert_eq!(stats.attempted(), 3);
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.loss_percent(), 67);
        let kinds: Vec<ProbeFailureKind> = log
            .events
            .iter()
            .filter_map(|e| match e {
                Event::ProbeFailed { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![ProbeFailureKind::Timeout, ProbeFailureKind::HostNotFound]);
    }

    #[tokio::test]
    async fn interrupt_mid_loop_keeps_completed_iterations_only() {
        let cancel = CancellationToken::new();
        // 第三次探测进行中收到中断
        let probe = ScriptedProbe::new(vec![Ok(120), Err(ProbeFailureKind::ConnectionRefused)], cancel.clone());
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();

        let end = probe_loop(&probe, &target(), None, Duration::ZERO, &mut stats, &cancel, &mut log, |_| Ok(()))
            .await
            .unwrap();

        assert_eq!(end, LoopEnd::Interrupted);
        assert_eq!(probe.calls(), 3);
        assert_eq!(stats.attempted(), 2);
        assert_eq!(stats.succeeded(), 1);
    }

    #[tokio::test]
    async fn interrupt_during_delay_stops_loop() {
        let cancel = CancellationToken::new();
        let probe = ScriptedProbe::new(vec![Ok(10); 10], cancel.clone());
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let end = probe_loop(&probe, &target(), None, Duration::from_secs(60), &mut stats, &cancel, &mut log, |_| Ok(()))
            .await
            .unwrap();

        assert_eq!(end, LoopEnd::Interrupted);
        assert_eq!(stats.attempted(), 1);
    }

    #[tokio::test]
    async fn no_delay_after_final_counted_iteration() {
        let cancel = CancellationToken::new();
        let probe = ScriptedProbe::new(vec![Ok(10), Ok(20)], cancel.clone());
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();

        // 两次探测之间仍会等待，这里只有最后一次之后的等待被跳过
        let end = tokio::time::timeout(
            Duration::from_secs(1),
            probe_loop(&probe, &target(), Some(1), Duration::from_secs(60), &mut stats, &cancel, &mut log, |_| Ok(())),
        )
        .await
        .expect("loop slept after its final iteration")
        .unwrap();
        assert_eq!(end, LoopEnd::Completed);
        assert_eq!(stats.attempted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn counted_loop_sleeps_only_between_iterations() {
        let cancel = CancellationToken::new();
        let probe = ScriptedProbe::new(vec![Ok(10), Ok(20)], cancel.clone());
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();

        let begin = tokio::time::Instant::now();
        let end = probe_loop(&probe, &target(), Some(2), Duration::from_secs(60), &mut stats, &cancel, &mut log, |_| Ok(()))
            .await
            .unwrap();

        assert_eq!(end, LoopEnd::Completed);
        assert_eq!(stats.attempted(), 2);
        // 一次间隔，而不是两次
        let waited = begin.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(120), "{:?}", waited);
    }

    #[tokio::test]
    async fn dead_core_aborts_loop() {
        let cancel = CancellationToken::new();
        let probe = ScriptedProbe::new(vec![Ok(10); 5], cancel.clone());
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();
        let mut checks = 0;

        let err = probe_loop(&probe, &target(), Some(5), Duration::ZERO, &mut stats, &cancel, &mut log, |_| {
            checks += 1;
            if checks > 2 {
                Err(Error::ProcessExitedEarly { code: Some(1), detail: "gone".to_string() })
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ProcessExitedEarly { .. }));
        assert_eq!(stats.attempted(), 2);
    }

    #[tokio::test]
    async fn zero_count_runs_nothing() {
        let cancel = CancellationToken::new();
        let probe = ScriptedProbe::new(vec![], cancel.clone());
        let mut stats = PingStatistics::new();
        let mut log = EventLog::default();

        let end = probe_loop(&probe, &target(), Some(0), Duration::ZERO, &mut stats, &cancel, &mut log, |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(end, LoopEnd::Completed);
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn unrecognized_input_fails_before_anything_starts() {
        let mut ctx = RunContext::new(
            Settings::default(),
            RunOptions::new("no-such-config.json"),
            EventLog::default(),
            CancellationToken::new(),
        );
        let err = ctx.run().await.unwrap_err();
        assert!(matches!(err, Error::InputNotRecognized(_)));
        assert!(ctx.reporter().events.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let mut settings = Settings::default();
        settings.core.binary_path = "/nonexistent/xray".to_string();
        settings.core.fallback_name = "vlessping-no-such-core".to_string();
        let mut ctx = RunContext::new(
            settings,
            RunOptions::new("vless://u@h:443"),
            EventLog::default(),
            CancellationToken::new(),
        );
        let err = ctx.run().await.unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound(ref s) if s.contains("vlessping-no-such-core")));
        assert!(matches!(ctx.reporter().events.as_slice(), [Event::InputDerived { .. }]));
    }
}
