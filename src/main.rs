use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vlessping::ui::{self, ConsoleReporter};
use vlessping::{init_logger, Args, RunContext, Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);
    ui::print_banner(VERSION);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // 加载配置
    let mut settings = Settings::load(args.settings.as_deref())?;
    settings.apply_env();
    debug!("settings: {:?}", settings);

    let verbose = args.verbose;
    let options = args.into_run_options();

    // Ctrl+C 取消运行，清理由运行流程完成
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到中断信号");
            token.cancel();
        }
    });

    let mut ctx = RunContext::new(settings, options, ConsoleReporter::new(verbose), cancel);
    let outcome = ctx.run().await?;
    debug!("run finished: {:?}", outcome);
    Ok(())
}
