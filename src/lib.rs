//! vlessping - measure round-trip latency through a VLESS proxy
//!
//! The proxy core (Xray) does the tunneling; this crate derives its config,
//! supervises it and drives the probe loop.

// 重导出core库
pub use vlessping_core::{
    init_logger, ConnectionDescriptor, Error, Event, EventLog, PingStatistics, Reporter, Result,
    RunContext, RunOptions, RunOutcome, Settings, Summary,
};
pub use vlessping_cli::Args;

// 可选的命令行界面
#[cfg(feature = "ui")]
pub mod ui;
