//! 传输统计模块
//!
//! 传输循环每个 period 记录一次间隔，设备回调记录 underrun/overrun。
//! 所有操作都是 lock-free 的，可以在实时回调中使用。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// 间隔缓冲区大小（只保留最近 N 个 period）
const INTERVAL_BUFFER_SIZE: usize = 256;

/// 传输统计收集器
pub struct TransferStats {
    epoch: Instant,
    last_period_ns: AtomicU64,

    interval_buffer: Box<[AtomicU64; INTERVAL_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    periods: AtomicU64,
    bytes: AtomicU64,
    underrun_count: AtomicU64,
    overrun_count: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_period_ns: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            periods: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            overrun_count: AtomicU64::new(0),
        }
    }

    /// 传输循环每完成一个 period 调用一次
    #[inline]
    pub fn on_period(&self, bytes: usize) {
        // +1 保证第一个时间戳非零
        let now = self.epoch.elapsed().as_nanos() as u64 + 1;
        let last = self.last_period_ns.swap(now, Ordering::Relaxed);

        if last > 0 {
            let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                % INTERVAL_BUFFER_SIZE;
            self.interval_buffer[idx].store(now.saturating_sub(last), Ordering::Relaxed);
        }

        self.periods.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 暂停后调用，避免把暂停时长算进 period 间隔
    pub fn mark_resumed(&self) {
        self.last_period_ns.store(0, Ordering::Relaxed);
    }

    /// 设备回调：播放数据不足
    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 设备回调：录音数据溢出
    #[inline]
    pub fn record_overrun(&self) {
        self.overrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, period_ms: f64) -> StatsReport {
        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();

        let interval_stats = match (intervals_ns.iter().min(), intervals_ns.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        StatsReport {
            periods: self.periods.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            expected_interval_ns: (period_ms * 1_000_000.0) as u64,
            interval_stats,
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            overrun_count: self.overrun_count.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.last_period_ns.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.periods.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.overrun_count.store(0, Ordering::Relaxed);

        for slot in self.interval_buffer.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    pub periods: u64,
    pub bytes: u64,
    pub expected_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub underrun_count: u64,
    pub overrun_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

impl StatsReport {
    /// 最大与最小 period 间隔之差
    pub fn jitter_ns(&self) -> u64 {
        self.interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns)
    }
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Transfer Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Periods: {}", self.periods)?;
        writeln!(f, "Bytes: {}", self.bytes)?;
        writeln!(f)?;

        writeln!(f, "Period Timing:")?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            self.expected_interval_ns as f64 / 1_000_000.0
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(
            f,
            "    Min: {:.2} ms",
            self.interval_stats.min_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Max: {:.2} ms",
            self.interval_stats.max_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Avg: {:.2} ms",
            self.interval_stats.avg_ns as f64 / 1_000_000.0
        )?;

        let jitter_pct = if self.expected_interval_ns > 0 {
            self.jitter_ns() as f64 / self.expected_interval_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            f,
            "  Jitter: {:.2} ms ({:.1}%)",
            self.jitter_ns() as f64 / 1_000_000.0,
            jitter_pct
        )?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Overruns: {}", self.overrun_count)?;

        Ok(())
    }
}
