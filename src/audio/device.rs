//! 设备会话
//!
//! 持有一个打开的设备流和协商后的配置。生命周期：
//! Closed → Open → Streaming → Open … → Closed
//!
//! 同一时间只允许一个传输循环使用设备：`lease()` 获取独占租约，
//! 后来者阻塞到前一个循环退出为止。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use super::backend::{AudioBackend, DeviceError, Direction, PcmStream};
use super::format::AudioFormat;
use super::stats::TransferStats;
use crate::config::DeviceConfig;

/// 设备会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Streaming,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_STREAMING: u8 = 2;

pub struct DeviceSession {
    direction: Direction,
    config: DeviceConfig,
    backend_name: String,
    stats: Arc<TransferStats>,
    stream: Mutex<Option<Box<dyn PcmStream>>>,
    state: AtomicU8,
}

impl DeviceSession {
    /// 打开设备并校验协商结果
    ///
    /// 硬件固定 period 的后端会改写 `config.period_size`；其余参数不一致时
    /// 关闭设备并返回 `ParameterMismatch`，列出每个参数的推荐值。
    pub fn open(
        backend: &dyn AudioBackend,
        direction: Direction,
        mut config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        if direction == Direction::Playback {
            if let Err(e) = backend.release_system_mixer() {
                log::warn!("Could not release system mixer: {}", e);
            }
        }

        let stats = Arc::new(TransferStats::new());
        let mut stream = backend.open(direction, &config, Arc::clone(&stats))?;
        let params = stream.negotiated();

        let mut issues = Vec::new();
        if params.period_size != config.period_size {
            if params.period_fixed {
                log::warn!(
                    "Period size is fixed by the device: using {} frames instead of {}",
                    params.period_size,
                    config.period_size
                );
                config.period_size = params.period_size;
            } else {
                issues.push(format!(
                    "period size {} frames not accepted, {} frames is recommended",
                    config.period_size, params.period_size
                ));
            }
        }
        if params.periods_per_buffer != config.periods_per_buffer {
            issues.push(format!(
                "{} periods per buffer not accepted, {} is recommended",
                config.periods_per_buffer, params.periods_per_buffer
            ));
        }
        if params.channels != config.channels {
            issues.push(format!(
                "{} channels not accepted, {} is recommended",
                config.channels, params.channels
            ));
        }
        if params.sample_rate != config.sample_rate {
            issues.push(format!(
                "sample rate {} Hz not accepted, {} Hz is recommended",
                config.sample_rate, params.sample_rate
            ));
        }
        if params.bit_depth != config.bit_depth {
            issues.push(format!(
                "{} not accepted, {} is recommended",
                config.bit_depth, params.bit_depth
            ));
        }

        if !issues.is_empty() {
            if let Err(e) = stream.close() {
                log::warn!("Failed to close rejected {} device: {}", direction, e);
            }
            return Err(DeviceError::ParameterMismatch(issues));
        }

        log::info!(
            "{} device open via {}: {}Hz {}ch {}, period {} frames ({:.2} ms) x {}",
            direction,
            backend.name(),
            config.sample_rate,
            config.channels,
            config.bit_depth,
            config.period_size,
            config.period_ms(),
            config.periods_per_buffer
        );

        Ok(Self {
            direction,
            config,
            backend_name: backend.name(),
            stats,
            stream: Mutex::new(Some(stream)),
            state: AtomicU8::new(STATE_OPEN),
        })
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 协商后的配置
    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline]
    pub fn format(&self) -> AudioFormat {
        self.config.format()
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    pub fn state(&self) -> DeviceState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => DeviceState::Open,
            STATE_STREAMING => DeviceState::Streaming,
            _ => DeviceState::Closed,
        }
    }

    /// 获取设备的独占租约
    ///
    /// 前一个传输循环仍持有租约时阻塞；设备已关闭时返回 `Closed`
    pub fn lease(&self) -> Result<StreamLease<'_>, DeviceError> {
        let guard = match self.stream.try_lock() {
            Some(guard) => guard,
            None => {
                log::info!(
                    "{} device busy, waiting for the previous stream to finish",
                    self.direction
                );
                self.stream.lock()
            }
        };

        let stream = MutexGuard::try_map(guard, |s| s.as_mut()).map_err(|_| DeviceError::Closed)?;
        self.state.store(STATE_STREAMING, Ordering::Release);

        Ok(StreamLease {
            stream,
            state: &self.state,
        })
    }

    /// 关闭设备；重复调用无副作用，失败只记录日志
    pub fn close(&self) {
        let Some(mut stream) = self.stream.lock().take() else {
            return;
        };
        self.state.store(STATE_CLOSED, Ordering::Release);

        match stream.close() {
            Ok(()) => log::info!("{} device closed", self.direction),
            Err(e) => log::warn!("Failed to close {} device: {}", self.direction, e),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// 设备独占租约，离开作用域时释放
pub struct StreamLease<'a> {
    stream: MappedMutexGuard<'a, Box<dyn PcmStream>>,
    state: &'a AtomicU8,
}

impl StreamLease<'_> {
    #[inline]
    pub fn stream(&mut self) -> &mut dyn PcmStream {
        &mut **self.stream
    }
}

impl Drop for StreamLease<'_> {
    fn drop(&mut self) {
        // 租约期间设备不会被关闭（close 需要同一把锁）
        let _ = self.state.compare_exchange(
            STATE_STREAMING,
            STATE_OPEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::null_backend::NullBackend;
    use crate::config::BackendKind;
    use std::time::{Duration, Instant};

    fn config() -> DeviceConfig {
        DeviceConfig {
            backend: BackendKind::Null,
            channels: 1,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_open_lease_close() {
        let backend = NullBackend::new();
        let session = DeviceSession::open(&backend, Direction::Playback, config()).unwrap();
        assert_eq!(session.state(), DeviceState::Open);

        {
            let mut lease = session.lease().unwrap();
            assert_eq!(session.state(), DeviceState::Streaming);
            lease.stream().write(&[0u8; 2048]).unwrap();
        }
        assert_eq!(session.state(), DeviceState::Open);

        session.close();
        assert_eq!(session.state(), DeviceState::Closed);
        session.close();
        assert!(matches!(session.lease(), Err(DeviceError::Closed)));
    }

    #[test]
    fn test_fixed_period_overrides_config() {
        let backend = NullBackend::new().with_fixed_period(256);
        let session = DeviceSession::open(&backend, Direction::Playback, config()).unwrap();
        assert_eq!(session.config().period_size, 256);
        assert_eq!(session.config().period_bytes(), 512);
    }

    #[test]
    fn test_busy_mixer_does_not_block_open() {
        let backend = NullBackend::new().with_busy_mixer();
        let session = DeviceSession::open(&backend, Direction::Playback, config()).unwrap();
        assert_eq!(session.state(), DeviceState::Open);
        // 释放混音器（失败）+ open
        assert_eq!(backend.calls(), 2);

        // 录音设备不碰混音器
        let capture = DeviceSession::open(&backend, Direction::Capture, config()).unwrap();
        assert_eq!(capture.state(), DeviceState::Open);
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn test_mismatch_lists_recommendation() {
        let backend = NullBackend::new().with_sample_rate(48000);
        let err = DeviceSession::open(&backend, Direction::Capture, config())
            .err()
            .unwrap();
        match err {
            DeviceError::ParameterMismatch(issues) => {
                assert_eq!(issues.len(), 1);
                assert!(issues[0].contains("48000 Hz is recommended"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_second_lease_waits_for_first() {
        let backend = NullBackend::new();
        let session = Arc::new(DeviceSession::open(&backend, Direction::Playback, config()).unwrap());

        let first = session.lease().unwrap();
        let waiter = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                let start = Instant::now();
                let _lease = session.lease().unwrap();
                start.elapsed()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        drop(first);
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(40), "waited {:?}", waited);
    }
}
