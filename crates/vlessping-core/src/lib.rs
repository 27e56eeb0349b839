//! vlessping Core - proxy-session lifecycle for measuring latency through a VLESS proxy
//!
//! Derives a proxy-core configuration from a link or an existing config file, validates
//! and supervises the external proxy-core process, and drives the timed probe loop.

// 导出模块
pub mod binary;
pub mod config;
pub mod core_config;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod probe;
pub mod runner;
pub mod stats;
pub mod supervisor;

// 从模块导出核心类型
pub use binary::CoreBinary;
pub use config::{CoreSettings, FragmentSettings, ProbeSettings, Settings, StartupSettings};
pub use core_config::{FragmentInfo, ProxyConfigDocument};
pub use descriptor::{ConnectionDescriptor, DerivedInput, Provenance};
pub use error::{Error, Result};
pub use event::{Event, EventLog, Reporter};
pub use probe::{HttpProbe, Probe, ProbeFailure, ProbeFailureKind};
pub use runner::{probe_loop, LoopEnd, ProbeTarget, RunContext, RunOptions, RunOutcome};
pub use stats::{LatencySummary, PingStatistics, Summary};
pub use supervisor::{LineVerdict, Markers, OutputStream, ProcessSession, SessionState};

/// Initialize the logger
///
/// `RUST_LOG` 优先；否则默认 warn，verbose 时为 debug。输出到 stderr。
pub fn init_logger(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
