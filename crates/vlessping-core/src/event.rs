//! 运行期间发给显示层的结构化事件

use chrono::{DateTime, Local};

use crate::core_config::FragmentInfo;
use crate::descriptor::{ConnectionDescriptor, Provenance};
use crate::probe::ProbeFailureKind;
use crate::stats::Summary;
use crate::supervisor::OutputStream;

/// 运行事件
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// 输入已解析
    InputDerived {
        descriptor: ConnectionDescriptor,
        provenance: Provenance,
    },
    /// 链接输入启用了分片
    FragmentEnabled(FragmentInfo),
    /// 配置文件中检测到分片设置
    FragmentDetected(FragmentInfo),
    /// 配置文件输入时忽略了 --fragment
    FragmentFlagIgnored,
    /// 找到代理核心
    BinaryFound {
        program: String,
        version: Option<String>,
    },
    /// 分配了本地端口
    PortAllocated(u16),
    /// 配置校验通过
    ConfigValid,
    /// 正在启动代理核心
    CoreStarting,
    /// 代理核心输出的一行（仅 verbose 时渲染）
    CoreOutput { stream: OutputStream, line: String },
    /// 启动期间的致命错误行，立即显示
    CoreFatalLine(String),
    /// 已启动后出现的错误行
    CoreWarning(String),
    /// 代理核心已就绪
    CoreReady { port: u16 },
    /// 一次探测成功
    ProbeSucceeded {
        seq: u64,
        at: DateTime<Local>,
        address: String,
        label: String,
        latency_ms: u64,
    },
    /// 一次探测失败
    ProbeFailed {
        seq: u64,
        at: DateTime<Local>,
        address: String,
        label: String,
        kind: ProbeFailureKind,
    },
    /// 收到中断信号
    Interrupted,
    /// 统计汇总
    Summary(Summary),
    /// 代理核心已终止
    CoreStopped { exit_code: Option<i32> },
}

/// 事件接收方
pub trait Reporter {
    fn report(&mut self, event: Event);
}

impl<R: Reporter + ?Sized> Reporter for &mut R {
    fn report(&mut self, event: Event) {
        (**self).report(event);
    }
}

/// 收集事件，用于测试或离线渲染
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    pub events: Vec<Event>,
}

impl Reporter for EventLog {
    fn report(&mut self, event: Event) {
        self.events.push(event);
    }
}
