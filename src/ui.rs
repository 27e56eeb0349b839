//! UI相关功能模块
//!
//! 把运行事件渲染到终端：探测结果、启动进度和最终汇总。

use colored::*;
use console::Term;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use vlessping_core::{Event, OutputStream, Provenance, Reporter, Summary};

const BANNER: &str = r#"
╦  ╦╦  ╔═╗╔═╗╔═╗╔═╗╦╔╗╔╔═╗
╚╗╔╝║  ║╣ ╚═╗╚═╗╠═╝║║║║║ ╦
 ╚╝ ╩═╝╚═╝╚═╝╚═╝╩  ╩╝╚╝╚═╝
"#;

/// 打印横幅
pub fn print_banner(version: &str) {
    println!("{}\n{}\n", BANNER.cyan().bold(), format!("Version: {}", version).yellow());
}

/// 打印成功消息
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// 打印错误消息
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// 打印警告消息
pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow().bold(), msg);
}

/// 打印信息消息
pub fn print_info(msg: &str) {
    println!("{} {}", "i".blue().bold(), msg);
}

/// 延迟分档：100ms以内绿色，300ms以内黄色，其余红色
pub fn latency_color(latency_ms: u64) -> Color {
    match latency_ms {
        0..=100 => Color::Green,
        101..=300 => Color::Yellow,
        _ => Color::Red,
    }
}

pub fn colorize_latency(latency_ms: u64) -> ColoredString {
    format!("{}ms", latency_ms).color(latency_color(latency_ms))
}

/// 汇总的两行文本；没有成功的探测时只有第一行
pub fn summary_lines(summary: &Summary) -> Vec<String> {
    let mut lines = vec![format!(
        "Sent:{} Received:{} Lost:{} ({}% loss)",
        summary.sent, summary.received, summary.lost, summary.loss_percent
    )];
    if let Some(latency) = &summary.latency {
        lines.push(format!(
            "Min:{}ms Max:{}ms Avg:{}ms",
            latency.min_ms, latency.max_ms, latency.avg_ms
        ));
    }
    lines
}

/// 终端渲染器
pub struct ConsoleReporter {
    verbose: bool,
    interactive: bool,
    spinner: Option<ProgressBar>,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            interactive: Term::stderr().is_term(),
            spinner: None,
        }
    }

    fn start_spinner(&mut self) {
        if !self.interactive {
            print_info("Starting proxy core...");
            return;
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
            pb.set_style(style);
        }
        pb.set_message("Starting proxy core...");
        pb.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(pb);
    }

    fn stop_spinner(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }

    /// 输出一行，避免和进度条交错
    fn line(&self, text: String) {
        match &self.spinner {
            Some(pb) => pb.println(text),
            None => println!("{}", text),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn report(&mut self, event: Event) {
        match event {
            Event::InputDerived { descriptor, provenance } => {
                let source = match provenance {
                    Provenance::DirectUrl => "link",
                    Provenance::ExistingConfig => "config file",
                };
                print_info(&format!(
                    "{} {} ({}, {}) from {}",
                    descriptor.label.cyan().bold(),
                    descriptor.endpoint(),
                    descriptor.protocol,
                    descriptor.security,
                    source
                ));
            }
            Event::FragmentEnabled(info) => print_info(&format!(
                "Fragment enabled: packets={} length={} interval={}",
                info.packets, info.length, info.interval
            )),
            Event::FragmentDetected(info) => print_info(&format!(
                "Fragment settings found in config: packets={} length={} interval={}",
                info.packets, info.length, info.interval
            )),
            Event::FragmentFlagIgnored => {
                print_warning("--fragment is ignored for config files, using the file's own settings")
            }
            Event::BinaryFound { program, version } => match version {
                Some(v) => print_success(&format!("Proxy core: {} ({})", program, v)),
                None => print_success(&format!("Proxy core: {}", program)),
            },
            Event::PortAllocated(port) => {
                if self.verbose {
                    print_info(&format!("Local HTTP proxy port: {}", port));
                }
            }
            Event::ConfigValid => print_success("Config validated"),
            Event::CoreStarting => self.start_spinner(),
            Event::CoreOutput { stream, line } => {
                if self.verbose {
                    let tag = match stream {
                        OutputStream::Stdout => "core".bright_black(),
                        OutputStream::Stderr => "core!".bright_black(),
                    };
                    self.line(format!("{} {}", tag, line.bright_black()));
                }
            }
            Event::CoreFatalLine(line) => {
                self.stop_spinner();
                print_error(&line);
            }
            Event::CoreWarning(line) => {
                let text = format!("{} {}", "!".yellow().bold(), line);
                match &self.spinner {
                    Some(pb) => pb.println(text),
                    None => eprintln!("{}", text),
                }
            }
            Event::CoreReady { port } => {
                self.stop_spinner();
                print_success(&format!("Proxy core started on 127.0.0.1:{}", port));
                println!();
            }
            Event::ProbeSucceeded { seq, at, address, label, latency_ms } => {
                self.line(format!(
                    "{} #{} {} ({}) time={}",
                    format!("[{}]", at.format("%H:%M:%S")).bright_black(),
                    seq,
                    address.cyan(),
                    label,
                    colorize_latency(latency_ms)
                ));
            }
            Event::ProbeFailed { seq, at, address, label, kind } => {
                self.line(format!(
                    "{} #{} {} ({}) {}",
                    format!("[{}]", at.format("%H:%M:%S")).bright_black(),
                    seq,
                    address.cyan(),
                    label,
                    kind.label().red()
                ));
            }
            Event::Interrupted => {
                self.stop_spinner();
                println!();
                print_warning("Interrupted");
            }
            Event::Summary(summary) => {
                self.stop_spinner();
                println!("\n{}", "--- statistics ---".bold());
                for line in summary_lines(&summary) {
                    println!("{}", line);
                }
            }
            Event::CoreStopped { exit_code } => {
                self.stop_spinner();
                if self.verbose {
                    match exit_code {
                        Some(code) => print_info(&format!("Proxy core stopped (exit code {})", code)),
                        None => print_info("Proxy core stopped"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlessping_core::PingStatistics;

    #[test]
    fn summary_with_latency() {
        let mut stats = PingStatistics::new();
        for ms in [100, 150, 200] {
            stats.record_success(ms);
        }
        assert_eq!(
            summary_lines(&stats.summary()),
            vec![
                "Sent:3 Received:3 Lost:0 (0% loss)".to_string(),
                "Min:100ms Max:200ms Avg:150ms".to_string(),
            ]
        );
    }

    #[test]
    fn summary_without_successes() {
        let mut stats = PingStatistics::new();
        stats.record_failure();
        assert_eq!(summary_lines(&stats.summary()), vec!["Sent:1 Received:0 Lost:1 (100% loss)".to_string()]);
        assert_eq!(
            summary_lines(&PingStatistics::new().summary()),
            vec!["Sent:0 Received:0 Lost:0 (0% loss)".to_string()]
        );
    }

    #[test]
    fn latency_bands() {
        assert_eq!(latency_color(0), Color::Green);
        assert_eq!(latency_color(100), Color::Green);
        assert_eq!(latency_color(101), Color::Yellow);
        assert_eq!(latency_color(300), Color::Yellow);
        assert_eq!(latency_color(301), Color::Red);
        assert!(colorize_latency(42).to_string().contains("42ms"));
    }
}
