//! vlessping CLI - command line arguments for vlessping
//!
//! 把命令行参数转换成一次运行的选项。

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use vlessping_core::RunOptions;

/// 命令行参数
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "vlessping",
    version,
    about = "Measure round-trip latency through a VLESS proxy"
)]
pub struct Args {
    /// VLESS link (vless://...) or path to an existing proxy-core JSON config
    pub input: String,

    /// Enable TLS ClientHello fragmentation (links only)
    #[arg(short, long)]
    pub fragment: bool,

    /// Delay between probes in milliseconds
    #[arg(short, long, value_name = "MS", default_value_t = 1000)]
    pub delay: u64,

    /// Per-probe timeout in milliseconds
    #[arg(short, long, value_name = "MS", default_value_t = 5000)]
    pub timeout: u64,

    /// Number of probes; runs until interrupted when omitted
    #[arg(short, long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub count: Option<u64>,

    /// Settings file (defaults to ./vlessping.toml when present)
    #[arg(short, long, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Debug logging and echo of proxy-core output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn into_run_options(self) -> RunOptions {
        RunOptions {
            input: self.input,
            fragment: self.fragment,
            delay: Duration::from_millis(self.delay),
            timeout: Duration::from_millis(self.timeout),
            count: self.count,
        }
    }
}
