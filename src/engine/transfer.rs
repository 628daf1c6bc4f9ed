//! 传输循环
//!
//! Idle → Delaying → Active ⇄ Paused → Draining → Stopped
//!
//! 停止是协作式的，只在 period 边界上生效；最坏情况下的停止延迟是
//! 一个 period 加上设备缓冲区的清空时间。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::control::StreamControl;
use super::keys::{KeyAction, KeyBindings, KeyPress, KeySource};
use super::source::{CaptureSink, PeriodSource};
use super::vars::{offset_var, onset_var, HostVars};
use super::{EngineError, StreamEnd, StreamReport};
use crate::audio::backend::{DeviceError, Direction, PcmStream};
use crate::audio::device::DeviceSession;
use crate::audio::stats::{StatsReport, TransferStats};
use crate::audio::timing::Clock;
use crate::config::{DeviceConfig, StreamDuration};

/// 每个 period 的按键轮询超时
const KEY_POLL: Duration = Duration::from_millis(1);
/// 暂停中的唤醒间隔
const PAUSE_POLL: Duration = Duration::from_millis(10);

pub(crate) enum StreamData {
    Playback(PeriodSource),
    Capture(CaptureSink),
    /// 只模拟时序，不访问设备
    Dummy,
}

/// 准备好的一次流，可以在任意线程上运行
pub(crate) struct StreamJob {
    pub name: String,
    pub direction: Direction,
    /// dummy 模式下为 `None`
    pub device: Option<Arc<DeviceSession>>,
    pub config: DeviceConfig,
    pub data: StreamData,
    pub duration: StreamDuration,
    pub delay_ms: u64,
    pub stop_delay_ms: u64,
    /// `start` 命令发出的时刻，起始延迟从这里算起
    pub issued_at_ms: f64,
    pub record_timestamps: bool,
    pub bindings: KeyBindings,
    pub keys: Option<Box<dyn KeySource>>,
    pub clock: Clock,
    pub vars: HostVars,
    pub control: StreamControl,
}

#[derive(Default)]
struct Progress {
    onset_ms: f64,
    pause_ms: f64,
    periods: u64,
    frames: u64,
    duration_exceeded: bool,
    timestamps: Vec<f64>,
    key_presses: Vec<KeyPress>,
}

/// 循环退出（包括 panic）时标记 finished
struct FinishGuard(StreamControl);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

impl StreamJob {
    pub fn run(mut self) -> Result<StreamReport, EngineError> {
        let _finished = FinishGuard(self.control.clone());

        self.vars.set_text(self.key_var("presses"), "");
        self.vars.set_text(self.key_var("timestamps"), "");

        let data = std::mem::replace(&mut self.data, StreamData::Dummy);
        let result = match data {
            StreamData::Playback(source) => self.run_playback(source),
            StreamData::Capture(sink) => self.run_capture(sink),
            StreamData::Dummy => self.run_dummy(),
        };

        if let Err(e) = &result {
            log::error!("{} stream '{}' failed: {}", self.direction, self.name, e);
        }
        result
    }

    fn run_playback(&mut self, mut source: PeriodSource) -> Result<StreamReport, EngineError> {
        let device = self.device.clone().ok_or(DeviceError::Closed)?;
        let mut lease = device.lease()?;
        let stats = Arc::clone(device.stats());
        stats.reset();

        let format = self.config.format();
        let mut progress = Progress::default();

        self.apply_delay();
        self.mark_onset(&mut progress);

        let end = loop {
            let Some(data) = source.next_chunk()? else {
                break StreamEnd::SourceExhausted;
            };
            lease.stream().write(data).map_err(EngineError::Stream)?;
            stats.on_period(data.len());
            progress.periods += 1;
            progress.frames += format.bytes_to_frames(data.len()) as u64;
            self.stamp_period(&mut progress);

            self.service_keys(&mut progress);
            if self.wait_out_pause(Some(lease.stream()), &mut progress)? {
                stats.mark_resumed();
            }
            self.check_duration(&mut progress);

            if let Some(end) = self.early_end(&progress) {
                break end;
            }
        };

        if end != StreamEnd::SourceExhausted {
            self.drop_pending(lease.stream());
        }
        drop(source);
        log::info!("Transferred {} periods ({})", progress.periods, end);

        let playback_ms = format.frames_to_ms(progress.frames);
        let elapsed = self.clock.now_ms() - progress.onset_ms;
        let wait_to_finish = playback_ms - (elapsed - progress.pause_ms);
        self.vars.set_number("wait_to_finish", wait_to_finish.round());

        let mut waited = 0.0;
        if end == StreamEnd::SourceExhausted && wait_to_finish > 0.0 {
            log::debug!("Waiting {:.1} ms for the device buffer to play out", wait_to_finish);
            self.clock.sleep_ms(wait_to_finish);
            waited = wait_to_finish;
        }

        let offset_ms = self.mark_offset();
        drop(lease);

        if progress.periods > 0 {
            let periods_per_buffer = self.config.periods_per_buffer as u64;
            log::debug!(
                "Finished in period {} of {}",
                (progress.periods - 1) % periods_per_buffer + 1,
                periods_per_buffer
            );
        }

        let stats = stats.report(self.config.period_ms());
        Ok(self.report(progress, end, offset_ms, playback_ms, waited, stats, None))
    }

    fn run_capture(&mut self, mut sink: CaptureSink) -> Result<StreamReport, EngineError> {
        let device = self.device.clone().ok_or(DeviceError::Closed)?;
        let mut lease = device.lease()?;
        let stats = Arc::clone(device.stats());
        stats.reset();

        let mut progress = Progress::default();

        self.apply_delay();
        self.mark_onset(&mut progress);

        let end = match self.capture_loop(lease.stream(), &mut sink, &stats, &mut progress) {
            Ok(end) => end,
            Err(e) => {
                self.mark_offset();
                drop(lease);
                // 出错前已采集的数据仍然写入文件
                match sink.finish() {
                    Ok((path, frames)) => log::warn!(
                        "Saved {} frames captured before the failure to {}",
                        frames,
                        path.display()
                    ),
                    Err(finish) => log::warn!("Could not save the partial recording: {}", finish),
                }
                return Err(e);
            }
        };

        let offset_ms = self.mark_offset();
        drop(lease);
        log::info!("Captured {} periods ({})", progress.periods, end);

        let (path, _) = sink.finish().map_err(EngineError::Record)?;
        let recorded_ms = self.config.format().frames_to_ms(progress.frames);
        let stats = stats.report(self.config.period_ms());
        Ok(self.report(progress, end, offset_ms, recorded_ms, 0.0, stats, Some(path)))
    }

    fn capture_loop(
        &mut self,
        stream: &mut dyn PcmStream,
        sink: &mut CaptureSink,
        stats: &TransferStats,
        progress: &mut Progress,
    ) -> Result<StreamEnd, EngineError> {
        let mut buf = vec![0u8; self.config.period_bytes()];

        loop {
            self.service_keys(progress);
            if self.wait_out_pause(Some(&mut *stream), progress)? {
                stats.mark_resumed();
            }
            if self.check_duration(progress) {
                self.control.request_stop();
            }

            if !self.control.should_continue() {
                if self.stop_delay_ms >= 1 {
                    log::info!("Recording {} ms more before stopping", self.stop_delay_ms);
                    let stop_at = self.clock.now_ms();
                    while self.clock.now_ms() - stop_at <= self.stop_delay_ms as f64 {
                        self.capture_period(stream, &mut buf, sink, stats, progress)?;
                    }
                }
                self.drop_pending(stream);
                return Ok(if progress.duration_exceeded {
                    StreamEnd::DurationExceeded
                } else {
                    StreamEnd::Stopped
                });
            }

            self.capture_period(stream, &mut buf, sink, stats, progress)?;
        }
    }

    fn capture_period(
        &self,
        stream: &mut dyn PcmStream,
        buf: &mut [u8],
        sink: &mut CaptureSink,
        stats: &TransferStats,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        stream.read(buf).map_err(EngineError::Stream)?;
        sink.push(buf).map_err(EngineError::Record)?;
        stats.on_period(buf.len());
        progress.periods += 1;
        progress.frames += self.config.period_size as u64;
        self.stamp_period(progress);
        Ok(())
    }

    /// 不访问设备，按 period 节拍睡眠模拟传输
    fn run_dummy(&mut self) -> Result<StreamReport, EngineError> {
        let stats = TransferStats::new();
        let period_ms = self.config.period_ms();
        let period_bytes = self.config.period_bytes();
        let mut progress = Progress::default();

        self.apply_delay();
        self.mark_onset(&mut progress);

        let end = if self.direction == Direction::Playback && self.duration == StreamDuration::Natural {
            StreamEnd::SourceExhausted
        } else {
            loop {
                self.service_keys(&mut progress);
                if self.wait_out_pause(None, &mut progress)? {
                    stats.mark_resumed();
                }
                self.check_duration(&mut progress);
                if let Some(end) = self.early_end(&progress) {
                    break end;
                }

                self.clock.sleep_ms(period_ms);
                stats.on_period(period_bytes);
                progress.periods += 1;
                progress.frames += self.config.period_size as u64;
                self.stamp_period(&mut progress);
            }
        };

        let offset_ms = self.mark_offset();
        log::info!("Dummy {} stream '{}' done ({})", self.direction, self.name, end);

        let simulated_ms = self.config.format().frames_to_ms(progress.frames);
        let stats = stats.report(period_ms);
        Ok(self.report(progress, end, offset_ms, simulated_ms, 0.0, stats, None))
    }

    /// 剩余延迟 = 请求的延迟 − 自 start 命令以来已经过的时间；不足 1 ms 不睡眠
    fn apply_delay(&self) {
        if self.delay_ms == 0 {
            return;
        }
        let remaining = self.delay_ms as f64 - (self.clock.now_ms() - self.issued_at_ms);
        if remaining >= 1.0 {
            log::info!("Delaying {} start by {:.1} ms", self.direction, remaining);
            self.clock.sleep_ms(remaining);
        }
    }

    fn mark_onset(&self, progress: &mut Progress) {
        let now = self.clock.now_ms();
        progress.onset_ms = now;
        if self.record_timestamps {
            progress.timestamps.push(now);
        }
        self.vars.set_number(onset_var(&self.name), now);
        self.control.mark_started();
        log::info!("Started {} stream '{}' at {:.3} ms", self.direction, self.name, now);
    }

    fn mark_offset(&self) -> f64 {
        let now = self.clock.now_ms();
        self.vars.set_number(offset_var(&self.name), now);
        now
    }

    #[inline]
    fn stamp_period(&self, progress: &mut Progress) {
        if self.record_timestamps {
            progress.timestamps.push(self.clock.now_ms());
        }
    }

    fn key_var(&self, what: &str) -> String {
        format!("{}_key_{}", self.name, what)
    }

    /// 轮询一次按键并执行绑定的动作；只记录绑定过的按键
    fn service_keys(&mut self, progress: &mut Progress) {
        if self.bindings.is_empty() {
            return;
        }
        let Some(keys) = self.keys.as_mut() else {
            return;
        };
        let Some(key) = keys.poll_key(KEY_POLL) else {
            return;
        };
        let Some(action) = self.bindings.action(&key) else {
            return;
        };

        let time_ms = self.clock.now_ms();
        self.vars.append_item(&self.key_var("presses"), &key);
        self.vars
            .append_item(&self.key_var("timestamps"), &format!("{:.3}", time_ms));

        match action {
            KeyAction::Stop => {
                log::info!("Stop key '{}' pressed", key);
                self.control.request_stop();
            }
            KeyAction::TogglePause => {
                let paused = self.control.toggle_pause();
                log::info!(
                    "Key '{}' pressed: {}",
                    key,
                    if paused { "pausing" } else { "resuming" }
                );
            }
        }
        progress.key_presses.push(KeyPress { key, time_ms });
    }

    /// 处于暂停时阻塞到恢复或停止，期间继续响应按键；返回是否发生过暂停
    ///
    /// 播放在暂停中也检查时长，超时立即结束暂停
    fn wait_out_pause(
        &mut self,
        mut stream: Option<&mut dyn PcmStream>,
        progress: &mut Progress,
    ) -> Result<bool, EngineError> {
        if !self.control.is_paused() || !self.control.should_continue() {
            return Ok(false);
        }

        let paused_at = self.clock.now_ms();
        let device_pause = match stream.as_deref_mut() {
            Some(s) if s.supports_pause() => {
                s.pause(true).map_err(EngineError::Stream)?;
                true
            }
            Some(_) => {
                log::warn!("{} device cannot pause, buffered audio keeps running", self.direction);
                false
            }
            None => false,
        };
        log::info!("Paused {} stream '{}'", self.direction, self.name);

        while self.control.wait_while_paused(PAUSE_POLL) {
            self.service_keys(progress);
            if self.direction == Direction::Playback && self.check_duration(progress) {
                break;
            }
        }

        if device_pause {
            if let Some(s) = stream.as_deref_mut() {
                s.pause(false).map_err(EngineError::Stream)?;
            }
        }
        let paused_for = self.clock.now_ms() - paused_at;
        progress.pause_ms += paused_for;
        log::info!(
            "Resumed {} stream '{}' after {:.1} ms",
            self.direction,
            self.name,
            paused_for
        );
        Ok(true)
    }

    /// now − onset ≥ duration 时置位 `duration_exceeded`
    fn check_duration(&self, progress: &mut Progress) -> bool {
        if progress.duration_exceeded {
            return true;
        }
        let Some(limit) = self.duration.millis() else {
            return false;
        };
        if self.clock.now_ms() - progress.onset_ms >= limit as f64 {
            log::info!("Duration of {} ms exceeded, stopping '{}'", limit, self.name);
            progress.duration_exceeded = true;
        }
        progress.duration_exceeded
    }

    fn early_end(&self, progress: &Progress) -> Option<StreamEnd> {
        if !self.control.should_continue() {
            Some(StreamEnd::Stopped)
        } else if progress.duration_exceeded {
            Some(StreamEnd::DurationExceeded)
        } else {
            None
        }
    }

    /// 丢弃设备缓冲区中尚未播放/读取的数据；失败只记录日志
    fn drop_pending(&self, stream: &mut dyn PcmStream) {
        if !stream.supports_drop() {
            log::debug!("{} device cannot drop buffered audio", self.direction);
            return;
        }
        if let Err(e) = stream.drop_pending() {
            log::warn!("Failed to drop pending {} audio: {}", self.direction, e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        progress: Progress,
        end: StreamEnd,
        offset_ms: f64,
        playback_ms: f64,
        wait_to_finish_ms: f64,
        stats: StatsReport,
        file: Option<PathBuf>,
    ) -> StreamReport {
        StreamReport {
            name: self.name.clone(),
            onset_ms: progress.onset_ms,
            offset_ms,
            elapsed_ms: offset_ms - progress.onset_ms,
            pause_ms: progress.pause_ms,
            playback_ms,
            wait_to_finish_ms,
            periods: progress.periods,
            frames: progress.frames,
            end,
            duration_exceeded: progress.duration_exceeded,
            period_timestamps: progress.timestamps,
            key_presses: progress.key_presses,
            stats,
            file,
        }
    }
}
