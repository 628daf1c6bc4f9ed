//! 主机时钟
//!
//! 所有时间戳（onset/offset、每个 period 的时间戳、暂停时长）都是相对于
//! 同一个单调 epoch 的毫秒数（f64），与宿主程序的实验时钟同一量纲。

use std::time::{Duration, Instant};

/// 单调毫秒时钟，可廉价复制到工作线程
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// 自 epoch 以来的毫秒数
    #[inline]
    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// 睡眠指定毫秒数；非正值立即返回
    pub fn sleep_ms(&self, ms: f64) {
        if ms > 0.0 {
            std::thread::sleep(ms_to_duration(ms));
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// 毫秒（f64）转 Duration，负值截断为 0
#[inline]
pub fn ms_to_duration(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}
