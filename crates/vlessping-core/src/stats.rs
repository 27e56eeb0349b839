use serde::{Deserialize, Serialize};

/// 探测循环的累计统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingStatistics {
    attempted: u64,
    succeeded: u64,
    total_latency_ms: u64,
    min_latency_ms: u64,
    max_latency_ms: u64,
}

impl Default for PingStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl PingStatistics {
    pub fn new() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            total_latency_ms: 0,
            // 大于任何实际延迟的初始值
            min_latency_ms: u64::MAX,
            max_latency_ms: 0,
        }
    }

    /// 记录一次成功的探测
    pub fn record_success(&mut self, latency_ms: u64) {
        self.attempted += 1;
        self.succeeded += 1;
        self.total_latency_ms = self.total_latency_ms.saturating_add(latency_ms);
        self.min_latency_ms = self.min_latency_ms.min(latency_ms);
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
    }

    /// 记录一次失败的探测
    pub fn record_failure(&mut self) {
        self.attempted += 1;
    }

    pub fn attempted(&self) -> u64 {
        self.attempted
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn lost(&self) -> u64 {
        self.attempted - self.succeeded
    }

    /// 丢包率（四舍五入的百分比），没有探测时为0
    pub fn loss_percent(&self) -> u64 {
        if self.attempted == 0 {
            return 0;
        }
        (self.lost() as f64 / self.attempted as f64 * 100.0).round() as u64
    }

    pub fn min_ms(&self) -> Option<u64> {
        (self.succeeded > 0).then_some(self.min_latency_ms)
    }

    pub fn max_ms(&self) -> Option<u64> {
        (self.succeeded > 0).then_some(self.max_latency_ms)
    }

    pub fn avg_ms(&self) -> Option<u64> {
        (self.succeeded > 0)
            .then(|| (self.total_latency_ms as f64 / self.succeeded as f64).round() as u64)
    }

    pub fn summary(&self) -> Summary {
        Summary {
            sent: self.attempted,
            received: self.succeeded,
            lost: self.lost(),
            loss_percent: self.loss_percent(),
            latency: self.min_ms().zip(self.max_ms()).zip(self.avg_ms()).map(
                |((min_ms, max_ms), avg_ms)| LatencySummary { min_ms, max_ms, avg_ms },
            ),
        }
    }
}

/// 渲染用的汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub sent: u64,
    pub received: u64,
    pub lost: u64,
    pub loss_percent: u64,
    /// 至少一次成功时才有
    pub latency: Option<LatencySummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_statistics() {
        let stats = PingStatistics::new();
        let summary = stats.summary();
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.lost, 0);
        assert_eq!(summary.loss_percent, 0);
        assert!(summary.latency.is_none());
    }

    #[test]
    fn three_successes() {
        let mut stats = PingStatistics::new();
        for ms in [100, 150, 200] {
            stats.record_success(ms);
        }
        assert_eq!(
            stats.summary(),
            Summary {
                sent: 3,
                received: 3,
                lost: 0,
                loss_percent: 0,
                latency: Some(LatencySummary { min_ms: 100, max_ms: 200, avg_ms: 150 }),
            }
        );
    }

    #[test]
    fn loss_and_average_are_rounded() {
        let mut stats = PingStatistics::new();
        stats.record_success(100);
        stats.record_failure();
        stats.record_failure();
        stats.record_success(101);
        stats.record_success(101);
        stats.record_failure();

        // 3/6 丢失
        assert_eq!(stats.loss_percent(), 50);
        // 302/3 = 100.67
        assert_eq!(stats.avg_ms(), Some(101));

        let mut stats = PingStatistics::new();
        stats.record_success(10);
        stats.record_failure();
        stats.record_failure();
        // 2/3 = 66.67%
        assert_eq!(stats.loss_percent(), 67);
    }

    #[test]
    fn invariants_hold_for_mixed_sequences() {
        let outcomes: [Option<u64>; 9] = [Some(40), None, Some(900), Some(3), None, None, Some(77), Some(77), None];
        let mut stats = PingStatistics::new();
        let mut seen = Vec::new();
        for outcome in outcomes {
            match outcome {
                Some(ms) => {
                    stats.record_success(ms);
                    seen.push(ms);
                }
                None => stats.record_failure(),
            }
            assert!(stats.succeeded() <= stats.attempted());
        }

        assert_eq!(stats.attempted(), 9);
        assert_eq!(stats.succeeded(), 5);
        assert_eq!(stats.loss_percent(), 44);
        let (min, max) = (stats.min_ms().unwrap(), stats.max_ms().unwrap());
        assert!(seen.iter().all(|ms| min <= *ms && *ms <= max));
        assert_eq!(stats.avg_ms(), Some((1097.0f64 / 5.0).round() as u64));
    }

    #[test]
    fn all_failures_have_no_latency() {
        let mut stats = PingStatistics::new();
        stats.record_failure();
        stats.record_failure();
        assert_eq!(stats.loss_percent(), 100);
        assert_eq!(stats.min_ms(), None);
        assert_eq!(stats.max_ms(), None);
        assert_eq!(stats.avg_ms(), None);
    }
}
