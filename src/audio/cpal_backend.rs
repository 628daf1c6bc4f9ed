//! cpal 主机 API 后端（ALSA / JACK / CoreAudio / WASAPI）
//!
//! cpal 是回调模型，引擎需要阻塞式的 write/read：
//! - 设备回调和传输循环之间用 SPSC 字节 ring buffer 连接，容量 = 一个设备缓冲区
//! - ring buffer 满时 `write` 自适应等待，于是传输循环被设备节拍驱动
//! - `cpal::Stream` 不是 `Send`，在专用线程上创建并持有，通过命令通道暂停/恢复/关闭

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;

use super::backend::{
    AudioBackend, DeviceError, DeviceInfo, Direction, NegotiatedParams, PcmStream,
};
use super::format::{BitDepth, PcmSample};
use super::ring_buffer::RingBuffer;
use super::stats::TransferStats;
use crate::config::DeviceConfig;

/// 设备在这段时间内没有消费/产出任何数据则视为失效
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// cpal 后端
pub struct CpalBackend {
    host_name: Option<String>,
}

impl CpalBackend {
    pub fn new(host_name: Option<String>) -> Self {
        Self { host_name }
    }

    fn host(&self) -> Result<cpal::Host, DeviceError> {
        let Some(name) = self.host_name.as_deref() else {
            return Ok(cpal::default_host());
        };

        let id = cpal::available_hosts()
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| DeviceError::DeviceNotFound(format!("audio host '{}'", name)))?;

        cpal::host_from_id(id).map_err(|e| DeviceError::Backend(e.to_string()))
    }

    fn find_device(
        host: &cpal::Host,
        direction: Direction,
        device_id: Option<&str>,
    ) -> Result<cpal::Device, DeviceError> {
        let Some(id) = device_id else {
            let device = match direction {
                Direction::Playback => host.default_output_device(),
                Direction::Capture => host.default_input_device(),
            };
            return device
                .ok_or_else(|| DeviceError::DeviceNotFound(format!("default {} device", direction)));
        };

        let mut devices = match direction {
            Direction::Playback => host.output_devices(),
            Direction::Capture => host.input_devices(),
        }
        .map_err(|e| DeviceError::Backend(e.to_string()))?;

        devices
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))
    }
}

fn sample_format(bit_depth: BitDepth) -> Option<cpal::SampleFormat> {
    match bit_depth {
        BitDepth::U8 => Some(cpal::SampleFormat::U8),
        BitDepth::S16 => Some(cpal::SampleFormat::I16),
        BitDepth::S32 => Some(cpal::SampleFormat::I32),
        // cpal 没有打包的 24-bit 整数格式
        BitDepth::S24 => None,
    }
}

/// 检查设备是否支持请求的参数，不支持时给出推荐值
fn check_support(
    device: &cpal::Device,
    device_name: &str,
    direction: Direction,
    config: &DeviceConfig,
    format: cpal::SampleFormat,
) -> Result<(), DeviceError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Playback => device
            .supported_output_configs()
            .map_err(|e| DeviceError::Backend(e.to_string()))?
            .collect(),
        Direction::Capture => device
            .supported_input_configs()
            .map_err(|e| DeviceError::Backend(e.to_string()))?
            .collect(),
    };

    let same_format: Vec<_> = ranges
        .iter()
        .filter(|r| r.sample_format() == format)
        .collect();
    if same_format.is_empty() {
        return Err(DeviceError::FormatUnsupported {
            device: device_name.to_string(),
            detail: format!("{} integer samples", config.bit_depth),
        });
    }

    let mut issues = Vec::new();

    let same_channels: Vec<_> = same_format
        .iter()
        .copied()
        .filter(|r| r.channels() == config.channels)
        .collect();
    let candidates = if same_channels.is_empty() {
        let recommended = same_format.iter().map(|r| r.channels()).max().unwrap_or(0);
        issues.push(format!(
            "{} channels not supported, {} is recommended",
            config.channels, recommended
        ));
        same_format
    } else {
        same_channels
    };

    let rate = config.sample_rate;
    let with_rate = candidates
        .iter()
        .find(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0);
    let range = match with_rate {
        Some(range) => *range,
        None => {
            if let Some(first) = candidates.first() {
                issues.push(format!(
                    "sample rate {} Hz not supported, {} Hz is recommended",
                    rate,
                    first.max_sample_rate().0
                ));
            }
            return Err(DeviceError::ParameterMismatch(issues));
        }
    };

    if let cpal::SupportedBufferSize::Range { min, max } = range.buffer_size() {
        let (min, max) = (*min, *max);
        if config.period_size < min || config.period_size > max {
            issues.push(format!(
                "period size {} frames not supported, {} frames is recommended",
                config.period_size,
                config.period_size.clamp(min, max)
            ));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(DeviceError::ParameterMismatch(issues))
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> String {
        match &self.host_name {
            Some(name) => format!("cpal/{}", name),
            None => format!("cpal/{}", cpal::default_host().id().name()),
        }
    }

    fn enumerate(&self, direction: Direction) -> Result<Vec<DeviceInfo>, DeviceError> {
        let host = self.host()?;
        let default_name = match direction {
            Direction::Playback => host.default_output_device(),
            Direction::Capture => host.default_input_device(),
        }
        .and_then(|d| d.name().ok());

        let devices = match direction {
            Direction::Playback => host.output_devices(),
            Direction::Capture => host.input_devices(),
        }
        .map_err(|e| DeviceError::Backend(e.to_string()))?;

        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|id| DeviceInfo {
                is_default: default_name.as_deref() == Some(id.as_str()),
                id,
            })
            .collect())
    }

    fn open(
        &self,
        direction: Direction,
        config: &DeviceConfig,
        stats: Arc<TransferStats>,
    ) -> Result<Box<dyn PcmStream>, DeviceError> {
        let host = self.host()?;
        let device = Self::find_device(&host, direction, config.device_id.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "<unknown>".to_string());

        let format = sample_format(config.bit_depth).ok_or_else(|| DeviceError::FormatUnsupported {
            device: device_name.clone(),
            detail: format!("{} samples (use 16 or 32 bit)", config.bit_depth),
        })?;
        check_support(&device, &device_name, direction, config, format)?;

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.period_size),
        };

        let period_bytes = config.period_bytes();
        let ring = Arc::new(RingBuffer::<u8>::with_min_capacity(
            period_bytes * config.periods_per_buffer as usize,
        ));
        ring.lock_memory();

        let shared = Arc::new(SharedState::default());
        let io = CallbackIo {
            ring: Arc::clone(&ring),
            shared: Arc::clone(&shared),
            stats,
            scratch_len: period_bytes,
            frame_bytes: config.format().bytes_per_frame(),
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let (command_tx, command_rx) = mpsc::channel::<StreamCommand>();
        let thread_device_name = device_name.clone();

        let thread = thread::Builder::new()
            .name(format!("cpal-{}", direction))
            .spawn(move || {
                let stream = match build_stream(
                    &device,
                    &thread_device_name,
                    direction,
                    &stream_config,
                    format,
                    io,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Backend(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StreamCommand::Pause(paused, reply) => {
                            let result = if paused {
                                stream.pause().map_err(|e| e.to_string())
                            } else {
                                stream.play().map_err(|e| e.to_string())
                            };
                            let _ = reply.send(result.map_err(DeviceError::Backend));
                        }
                        StreamCommand::Shutdown => break,
                    }
                }
                drop(stream);
                log::debug!("cpal stream thread finished");
            })
            .map_err(|e| DeviceError::Backend(format!("failed to spawn stream thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(DeviceError::Backend("stream thread exited during setup".to_string()));
            }
        }

        log::info!(
            "cpal {} stream opened on '{}': {}Hz {}ch {}, period {} frames x {}",
            direction,
            device_name,
            config.sample_rate,
            config.channels,
            config.bit_depth,
            config.period_size,
            config.periods_per_buffer
        );

        let bytes_per_sec = config.sample_rate as u64 * config.format().bytes_per_frame() as u64;

        Ok(Box::new(CpalStream {
            direction,
            params: NegotiatedParams::accepted(config),
            ring,
            shared,
            frame_bytes: config.format().bytes_per_frame(),
            ns_per_byte: (1_000_000_000 / bytes_per_sec.max(1)).max(1),
            commands: Some(command_tx),
            thread: Some(thread),
        }))
    }
}

/// 设备回调与传输线程共享的状态
#[derive(Default)]
struct SharedState {
    /// 传输线程请求丢弃播放缓冲区，由回调（消费者）执行
    discard: AtomicBool,
    /// 回调至少读到过一次数据，之后的空读才算 underrun
    primed: AtomicBool,
    error: Mutex<Option<String>>,
}

enum StreamCommand {
    Pause(bool, mpsc::SyncSender<Result<(), DeviceError>>),
    Shutdown,
}

struct CallbackIo {
    ring: Arc<RingBuffer<u8>>,
    shared: Arc<SharedState>,
    stats: Arc<TransferStats>,
    scratch_len: usize,
    frame_bytes: usize,
}

fn build_stream(
    device: &cpal::Device,
    device_name: &str,
    direction: Direction,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    io: CallbackIo,
) -> Result<cpal::Stream, DeviceError> {
    let result = match (direction, format) {
        (Direction::Playback, cpal::SampleFormat::U8) => build_output::<u8>(device, config, io),
        (Direction::Playback, cpal::SampleFormat::I16) => build_output::<i16>(device, config, io),
        (Direction::Playback, cpal::SampleFormat::I32) => build_output::<i32>(device, config, io),
        (Direction::Capture, cpal::SampleFormat::U8) => build_input::<u8>(device, config, io),
        (Direction::Capture, cpal::SampleFormat::I16) => build_input::<i16>(device, config, io),
        (Direction::Capture, cpal::SampleFormat::I32) => build_input::<i32>(device, config, io),
        (_, other) => {
            return Err(DeviceError::FormatUnsupported {
                device: device_name.to_string(),
                detail: format!("{:?}", other),
            })
        }
    };

    result.map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::DeviceBusy(device_name.to_string()),
        cpal::BuildStreamError::StreamConfigNotSupported => DeviceError::FormatUnsupported {
            device: device_name.to_string(),
            detail: format!(
                "{}Hz {}ch, {:?}",
                config.sample_rate.0, config.channels, config.buffer_size
            ),
        },
        other => DeviceError::Backend(other.to_string()),
    })
}

fn error_callback(shared: Arc<SharedState>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        *shared.error.lock() = Some(err.to_string());
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    io: CallbackIo,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + PcmSample,
{
    let CallbackIo {
        ring,
        shared,
        stats,
        scratch_len,
        ..
    } = io;
    let on_error = error_callback(Arc::clone(&shared));
    let mut scratch = vec![0u8; scratch_len];
    let samples_per_chunk = (scratch_len / T::BYTES).max(1);

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if shared.discard.swap(false, Ordering::AcqRel) {
                ring.clear();
            }

            for chunk in data.chunks_mut(samples_per_chunk) {
                let want = chunk.len() * T::BYTES;
                let got = ring.read(&mut scratch[..want]);
                let full = got / T::BYTES;

                for (slot, bytes) in chunk[..full]
                    .iter_mut()
                    .zip(scratch[..got].chunks_exact(T::BYTES))
                {
                    *slot = T::read_le(bytes);
                }

                if full < chunk.len() {
                    chunk[full..].fill(T::EQUILIBRIUM);
                    if shared.primed.load(Ordering::Relaxed) {
                        stats.record_underrun();
                    }
                }
                if got > 0 {
                    shared.primed.store(true, Ordering::Relaxed);
                }
            }
        },
        on_error,
        None,
    )
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    io: CallbackIo,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + PcmSample,
{
    let CallbackIo {
        ring,
        shared,
        stats,
        scratch_len,
        frame_bytes,
    } = io;
    let on_error = error_callback(shared);
    let mut scratch = vec![0u8; scratch_len];
    let samples_per_chunk = (scratch_len / T::BYTES).max(1);

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for chunk in data.chunks(samples_per_chunk) {
                let len = chunk.len() * T::BYTES;
                for (sample, bytes) in chunk.iter().zip(scratch.chunks_exact_mut(T::BYTES)) {
                    sample.write_le(bytes);
                }

                // 只写完整的帧
                let free = ring.free_space();
                let fit = len.min(free - free % frame_bytes);
                if ring.write(&scratch[..fit]) < len {
                    stats.record_overrun();
                }
            }
        },
        on_error,
        None,
    )
}

/// 打开的 cpal 流
struct CpalStream {
    direction: Direction,
    params: NegotiatedParams,
    ring: Arc<RingBuffer<u8>>,
    shared: Arc<SharedState>,
    frame_bytes: usize,
    ns_per_byte: u64,
    commands: Option<mpsc::Sender<StreamCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn check_alive(&self) -> Result<(), DeviceError> {
        if self.commands.is_none() {
            return Err(DeviceError::Closed);
        }
        match self.shared.error.lock().take() {
            Some(message) => Err(DeviceError::StreamFailed(message)),
            None => Ok(()),
        }
    }

    /// 自适应等待
    ///
    /// 按需要等待的字节数估算时长：
    /// - < 50µs: 仅自旋
    /// - 50-500µs: yield + 短自旋
    /// - > 500µs: 睡眠预计时间的 70%
    fn adaptive_wait(&self, bytes_needed: usize) {
        let wait_us = (bytes_needed as u64 * self.ns_per_byte) / 1_000;

        if wait_us < 50 {
            for _ in 0..64 {
                std::hint::spin_loop();
            }
        } else if wait_us < 500 {
            thread::yield_now();
            for _ in 0..32 {
                std::hint::spin_loop();
            }
        } else {
            let sleep_us = (wait_us * 7 / 10).clamp(100, 10_000);
            thread::sleep(Duration::from_micros(sleep_us));
        }
    }
}

impl PcmStream for CpalStream {
    fn negotiated(&self) -> NegotiatedParams {
        self.params
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if self.direction != Direction::Playback {
            return Err(DeviceError::Unsupported("write on a capture stream"));
        }

        let mut remaining = data;
        let mut last_progress = Instant::now();

        while !remaining.is_empty() {
            self.check_alive()?;

            let free = self.ring.free_space();
            let n = remaining.len().min(free - free % self.frame_bytes);
            if n > 0 {
                let written = self.ring.write(&remaining[..n]);
                remaining = &remaining[written..];
                last_progress = Instant::now();
                continue;
            }

            if last_progress.elapsed() > STALL_TIMEOUT {
                return Err(DeviceError::StreamFailed(
                    "device stopped consuming audio".to_string(),
                ));
            }
            let needed = remaining.len().min(self.ring.capacity()).saturating_sub(free);
            self.adaptive_wait(needed);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        if self.direction != Direction::Capture {
            return Err(DeviceError::Unsupported("read on a playback stream"));
        }

        let mut filled = 0;
        let mut last_progress = Instant::now();

        while filled < buf.len() {
            self.check_alive()?;

            let n = self.ring.read(&mut buf[filled..]);
            if n > 0 {
                filled += n;
                last_progress = Instant::now();
                continue;
            }

            if last_progress.elapsed() > STALL_TIMEOUT {
                return Err(DeviceError::StreamFailed(
                    "device stopped producing audio".to_string(),
                ));
            }
            self.adaptive_wait(buf.len() - filled);
        }
        Ok(())
    }

    fn supports_pause(&self) -> bool {
        true
    }

    fn pause(&mut self, paused: bool) -> Result<(), DeviceError> {
        let commands = self.commands.as_ref().ok_or(DeviceError::Closed)?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        commands
            .send(StreamCommand::Pause(paused, reply_tx))
            .map_err(|_| DeviceError::StreamFailed("stream thread exited".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| DeviceError::StreamFailed("stream thread exited".to_string()))?
    }

    fn supports_drop(&self) -> bool {
        true
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        match self.direction {
            // 本线程是消费者，可以直接清空
            Direction::Capture => self.ring.clear(),
            Direction::Playback => {
                self.shared.discard.store(true, Ordering::Release);
                let backoff = Backoff::new();
                let deadline = Instant::now() + Duration::from_millis(100);
                while self.shared.discard.load(Ordering::Acquire) && Instant::now() < deadline {
                    backoff.snooze();
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let Some(commands) = self.commands.take() else {
            return Ok(());
        };
        let _ = commands.send(StreamCommand::Shutdown);

        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| DeviceError::Backend("stream thread panicked".to_string()))?;
        }
        log::info!("cpal {} stream closed", self.direction);
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close cpal stream: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_format_mapping() {
        assert_eq!(sample_format(BitDepth::U8), Some(cpal::SampleFormat::U8));
        assert_eq!(sample_format(BitDepth::S16), Some(cpal::SampleFormat::I16));
        assert_eq!(sample_format(BitDepth::S32), Some(cpal::SampleFormat::I32));
        assert_eq!(sample_format(BitDepth::S24), None);
    }

    #[test]
    fn test_unknown_host() {
        let backend = CpalBackend::new(Some("no-such-host".to_string()));
        assert!(matches!(
            backend.enumerate(Direction::Playback),
            Err(DeviceError::DeviceNotFound(_))
        ));
    }

    #[test]
    #[ignore] // 需要音频硬件
    fn test_enumerate_default_host() {
        let backend = CpalBackend::new(None);
        let devices = backend.enumerate(Direction::Playback).unwrap();
        assert!(!devices.is_empty());
    }

    #[test]
    #[ignore] // 需要音频硬件
    fn test_play_silence() {
        let backend = CpalBackend::new(None);
        let config = DeviceConfig::default();
        let mut stream = backend
            .open(Direction::Playback, &config, Arc::new(TransferStats::new()))
            .unwrap();
        let period = vec![0u8; config.period_bytes()];
        for _ in 0..20 {
            stream.write(&period).unwrap();
        }
        stream.drop_pending().unwrap();
        stream.close().unwrap();
    }
}
