//! 无硬件后端
//!
//! 用真实时间模拟一个设备缓冲区：写入在缓冲区满时阻塞，读取按采样率
//! 逐 period 产出静音。播放数据被丢弃。每次后端调用都会计数。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backend::{
    AudioBackend, DeviceError, DeviceInfo, Direction, NegotiatedParams, PcmStream,
};
use super::format::AudioFormat;
use super::stats::TransferStats;
use crate::config::DeviceConfig;

const DEVICE_ID: &str = "null";

/// 无硬件后端
#[derive(Debug, Clone, Default)]
pub struct NullBackend {
    calls: Arc<AtomicUsize>,
    fixed_period: Option<u32>,
    sample_rate_override: Option<u32>,
    /// 第 N 次 write/read（从 1 计）失败一次
    fail_transfer_at: Option<u64>,
    mixer_busy: bool,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟 period 大小由硬件固定的设备
    pub fn with_fixed_period(mut self, frames: u32) -> Self {
        self.fixed_period = Some(frames);
        self
    }

    /// 模拟只接受某个采样率的设备
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate_override = Some(rate);
        self
    }

    /// 模拟传输中途出错：每个打开的流的第 `n` 次 write/read 返回错误，之后恢复
    pub fn with_transfer_failure(mut self, n: u64) -> Self {
        self.fail_transfer_at = Some(n);
        self
    }

    /// 模拟无法释放的系统混音器
    pub fn with_busy_mixer(mut self) -> Self {
        self.mixer_busy = true;
        self
    }

    /// 迄今为止的后端调用次数（包括流上的调用）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> String {
        "null".to_string()
    }

    fn enumerate(&self, _direction: Direction) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.count();
        Ok(vec![DeviceInfo {
            id: DEVICE_ID.to_string(),
            is_default: true,
        }])
    }

    fn open(
        &self,
        direction: Direction,
        config: &DeviceConfig,
        stats: Arc<TransferStats>,
    ) -> Result<Box<dyn PcmStream>, DeviceError> {
        self.count();

        if let Some(id) = config.device_id.as_deref() {
            if id != DEVICE_ID {
                return Err(DeviceError::DeviceNotFound(id.to_string()));
            }
        }

        let mut params = NegotiatedParams::accepted(config);
        if let Some(frames) = self.fixed_period {
            params.period_size = frames;
            params.period_fixed = true;
        }
        if let Some(rate) = self.sample_rate_override {
            params.sample_rate = rate;
        }

        let format = AudioFormat::new(params.sample_rate, params.channels, params.bit_depth);
        let buffer_frames = params.period_size as u64 * params.periods_per_buffer as u64;

        log::debug!(
            "Null {} device opened: {}Hz {}ch {}, buffer {} frames",
            direction,
            params.sample_rate,
            params.channels,
            params.bit_depth,
            buffer_frames
        );

        Ok(Box::new(NullStream {
            direction,
            params,
            format,
            buffer: frames_to_duration(buffer_frames, params.sample_rate),
            playback_end: None,
            paused_remaining: None,
            capture_ready: None,
            stats,
            calls: Arc::clone(&self.calls),
            transfers: 0,
            fail_transfer_at: self.fail_transfer_at,
            closed: false,
        }))
    }

    fn release_system_mixer(&self) -> Result<(), DeviceError> {
        self.count();
        if self.mixer_busy {
            return Err(DeviceError::DeviceBusy("system mixer".to_string()));
        }
        Ok(())
    }
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / sample_rate as f64)
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}

struct NullStream {
    direction: Direction,
    params: NegotiatedParams,
    format: AudioFormat,
    /// 整个设备缓冲区的时长
    buffer: Duration,
    /// 播放：已排队数据全部播完的时刻
    playback_end: Option<Instant>,
    paused_remaining: Option<Duration>,
    /// 录音：最近一个 period 就绪的时刻
    capture_ready: Option<Instant>,
    stats: Arc<TransferStats>,
    calls: Arc<AtomicUsize>,
    transfers: u64,
    fail_transfer_at: Option<u64>,
    closed: bool,
}

impl NullStream {
    fn enter(&mut self, direction: Direction, op: &'static str) -> Result<(), DeviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err(DeviceError::Closed);
        }
        if self.direction != direction {
            return Err(DeviceError::Unsupported(op));
        }

        self.transfers += 1;
        if self.fail_transfer_at == Some(self.transfers) {
            self.fail_transfer_at = None;
            return Err(DeviceError::StreamFailed(format!(
                "simulated failure on transfer {}",
                self.transfers
            )));
        }
        Ok(())
    }

    fn chunk_duration(&self, bytes: usize) -> Duration {
        let frames = self.format.bytes_to_frames(bytes) as u64;
        frames_to_duration(frames, self.params.sample_rate)
    }
}

impl PcmStream for NullStream {
    fn negotiated(&self) -> NegotiatedParams {
        self.params
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.enter(Direction::Playback, "write on a capture stream")?;

        let chunk = self.chunk_duration(data.len()).min(self.buffer);
        let now = Instant::now();
        let end = match self.playback_end {
            Some(end) if end >= now => end,
            Some(_) => {
                self.stats.record_underrun();
                now
            }
            None => now,
        };

        // 等到缓冲区腾出 chunk 的空间
        if let Some(deadline) = end.checked_sub(self.buffer - chunk) {
            sleep_until(deadline);
        }
        self.playback_end = Some(end + chunk);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.enter(Direction::Capture, "read on a playback stream")?;

        let chunk = self.chunk_duration(buf.len());
        let now = Instant::now();
        let mut ready = match self.capture_ready {
            Some(prev) => prev + chunk,
            None => now + chunk,
        };
        // 读取落后超过整个缓冲区：数据已丢失
        if now > ready + self.buffer {
            self.stats.record_overrun();
            ready = now;
        }

        sleep_until(ready);
        self.format.fill_silence(buf);
        self.capture_ready = Some(ready);
        Ok(())
    }

    fn supports_pause(&self) -> bool {
        true
    }

    fn pause(&mut self, paused: bool) -> Result<(), DeviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err(DeviceError::Closed);
        }

        let now = Instant::now();
        if paused {
            self.paused_remaining = self
                .playback_end
                .map(|end| end.saturating_duration_since(now));
        } else {
            self.playback_end = self.paused_remaining.take().map(|rest| now + rest);
            self.capture_ready = None;
        }
        Ok(())
    }

    fn supports_drop(&self) -> bool {
        true
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.playback_end = None;
        self.capture_ready = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed {
            self.closed = true;
            log::debug!("Null {} device closed", self.direction);
        }
        Ok(())
    }
}
