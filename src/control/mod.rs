//! 控制面
//!
//! 宿主程序通过 `AudioController` 发出离散命令：
//! `init` → `start` → `pause`/`resume` → `stop`/`wait` → `close`。
//! 配置和文件校验都在 `start` 中同步完成，之后才会创建工作线程；
//! 循环内部的错误由 `wait`/`stop` 返回。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::backend::{create_backend, AudioBackend, Direction};
use crate::audio::device::DeviceSession;
use crate::audio::timing::Clock;
use crate::config::{ConfigError, EngineConfig, StartOptions, StreamDuration};
use crate::engine::{
    CaptureSink, EngineError, HostVars, KeyBindings, KeySource, PeriodSource, StreamControl,
    StreamData, StreamJob, StreamReport,
};
use crate::pcm::{apply_file_policy, resolve_output_path};

/// pause/resume 等待循环进入 Active 的轮询间隔
const STARTED_POLL: Duration = Duration::from_millis(1);

/// 命令顺序错误
#[derive(Debug, thiserror::Error)]
pub enum OrderingError {
    #[error("{0} called before init")]
    MissingInit(&'static str),
    #[error("{0} called before start")]
    NotStarted(&'static str),
    #[error("stream {0} is not the current stream")]
    UnknownStream(StreamId),
    #[error("stream {0} has already been collected")]
    Collected(StreamId),
}

/// `start` 返回的流标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type KeySourceFactory = Box<dyn FnMut() -> Option<Box<dyn KeySource>> + Send>;
type StreamOutcome = Result<StreamReport, EngineError>;

struct ActiveStream {
    id: StreamId,
    control: StreamControl,
    worker: Option<JoinHandle<StreamOutcome>>,
    outcome: Option<StreamOutcome>,
}

impl ActiveStream {
    /// 等待工作线程退出并保存结果
    fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(EngineError::WorkerPanicked));
            self.outcome = Some(outcome);
        }
    }

    fn take_outcome(&mut self) -> StreamOutcome {
        self.join();
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => Err(OrderingError::Collected(self.id).into()),
        }
    }
}

/// 一个方向（播放或录音）的控制器
pub struct AudioController {
    direction: Direction,
    backend: Option<Arc<dyn AudioBackend>>,
    config: Option<EngineConfig>,
    device: Option<Arc<DeviceSession>>,
    clock: Clock,
    vars: HostVars,
    key_source: Option<KeySourceFactory>,
    active: Option<ActiveStream>,
    next_id: u64,
}

impl AudioController {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            backend: None,
            config: None,
            device: None,
            clock: Clock::new(),
            vars: HostVars::new(),
            key_source: None,
            active: None,
            next_id: 1,
        }
    }

    /// 使用指定后端，而不是按配置创建
    pub fn with_backend(mut self, backend: Arc<dyn AudioBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 与其他控制器共享时钟
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// 与其他控制器共享变量表
    pub fn with_vars(mut self, vars: HostVars) -> Self {
        self.vars = vars;
        self
    }

    /// 设置了暂停/停止键的流在启动时调用 `factory` 获取按键来源
    pub fn with_key_source<F>(mut self, factory: F) -> Self
    where
        F: FnMut() -> Option<Box<dyn KeySource>> + Send + 'static,
    {
        self.key_source = Some(Box::new(factory));
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn vars(&self) -> &HostVars {
        &self.vars
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// 打开的设备会话；dummy 模式或未初始化时为 `None`
    pub fn device(&self) -> Option<&DeviceSession> {
        self.device.as_deref()
    }

    /// 校验配置并打开设备；已持有设备时先关闭旧设备
    pub fn init(&mut self, mut config: EngineConfig) -> Result<(), EngineError> {
        config.device.validate()?;
        self.shutdown();

        if config.dummy_mode {
            log::info!("{} controller in dummy mode, no device opened", self.direction);
        } else {
            let backend = match &self.backend {
                Some(backend) => Arc::clone(backend),
                None => create_backend(&config.device.backend),
            };
            let session = DeviceSession::open(backend.as_ref(), self.direction, config.device.clone())?;
            config.device = session.config().clone();
            self.device = Some(Arc::new(session));
        }

        self.publish_device_vars(&config);
        self.config = Some(config);
        Ok(())
    }

    fn publish_device_vars(&self, config: &EngineConfig) {
        let device = &config.device;
        let prefix = self.direction.to_string();
        self.vars
            .set_number(format!("{}_bitdepth", prefix), device.bit_depth.bits() as f64);
        self.vars
            .set_number(format!("{}_samplerate", prefix), device.sample_rate as f64);
        self.vars
            .set_number(format!("{}_channels", prefix), device.channels as f64);
        self.vars
            .set_number(format!("{}_period_size", prefix), device.period_size as f64);
        self.vars
            .set_number(format!("{}_period_time", prefix), device.period_ms());
    }

    /// 启动一个流
    ///
    /// 前台流在返回前已经结束，结果通过 `wait` 取回；循环失败时直接返回错误。
    /// 前一个流仍在运行时先等待它结束。
    pub fn start(&mut self, options: StartOptions) -> Result<StreamId, EngineError> {
        let issued_at_ms = self.clock.now_ms();
        let config = self
            .config
            .clone()
            .ok_or(OrderingError::MissingInit("start"))?;
        self.validate(&options, &config)?;

        self.finish_previous();
        let data = self.prepare(&options, &config)?;

        let id = StreamId(self.next_id);
        self.next_id += 1;

        let bindings = KeyBindings::new(options.pause_keys.clone(), options.stop_keys.clone());
        let keys = if bindings.is_empty() {
            None
        } else {
            self.key_source.as_mut().and_then(|factory| factory())
        };

        let control = StreamControl::new();
        let job = StreamJob {
            name: options.name.clone(),
            direction: self.direction,
            device: self.device.clone(),
            config: config.device.clone(),
            data,
            duration: options.duration,
            delay_ms: options.delay_ms,
            stop_delay_ms: options.stop_delay_ms,
            issued_at_ms,
            record_timestamps: options.period_timestamps,
            bindings,
            keys,
            clock: self.clock,
            vars: self.vars.clone(),
            control: control.clone(),
        };

        let (worker, outcome) = if options.background {
            let handle = thread::Builder::new()
                .name(format!("stream-{}", self.direction))
                .spawn(move || job.run())
                .map_err(EngineError::Spawn)?;
            log::debug!("{} stream {} running in the background", self.direction, id);
            (Some(handle), None)
        } else {
            (None, Some(Ok(job.run()?)))
        };

        self.active = Some(ActiveStream {
            id,
            control,
            worker,
            outcome,
        });
        Ok(id)
    }

    fn validate(&self, options: &StartOptions, config: &EngineConfig) -> Result<(), ConfigError> {
        if options.file.is_none() && !config.dummy_mode {
            return Err(ConfigError::MissingFile);
        }
        if self.direction == Direction::Capture {
            match options.duration {
                StreamDuration::Natural if !options.background && options.stop_keys.is_empty() => {
                    return Err(ConfigError::InfiniteWithoutStop);
                }
                StreamDuration::Millis(ms) if (ms as f64) < config.device.period_ms() => {
                    return Err(ConfigError::DurationTooShort {
                        duration_ms: ms,
                        period_ms: config.device.period_ms(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 打开播放文件或创建录音文件；dummy 模式不访问文件
    fn prepare(&self, options: &StartOptions, config: &EngineConfig) -> Result<StreamData, EngineError> {
        if config.dummy_mode {
            return Ok(StreamData::Dummy);
        }
        let file = options.file.as_deref().ok_or(ConfigError::MissingFile)?;

        match self.direction {
            Direction::Playback => {
                let path = playback_path(file, &config.base_dir);
                let (source, info) = PeriodSource::open(&path, &config.device, options.ram_cache)?;
                self.vars.set_number("wav_duration", info.duration_ms().round());
                log::info!(
                    "Prepared {} ({:.1} ms, {} frames)",
                    path.display(),
                    info.duration_ms(),
                    info.frames
                );
                Ok(StreamData::Playback(source))
            }
            Direction::Capture => {
                let path = resolve_output_path(file, &config.base_dir);
                let path = apply_file_policy(path, options.file_exists);
                let format = config.device.format();
                let expected_frames = options
                    .duration
                    .millis()
                    .map(|ms| ms.saturating_mul(format.sample_rate as u64) / 1000);
                let sink = CaptureSink::create(&path, format, options.ram_cache, expected_frames)?;
                log::info!("Recording to {}", sink.path().display());
                Ok(StreamData::Capture(sink))
            }
        }
    }

    /// 等待前一个流结束；未取回的结果被丢弃
    fn finish_previous(&mut self) {
        let Some(mut previous) = self.active.take() else {
            return;
        };
        if previous.worker.is_some() && !previous.control.is_finished() {
            log::info!(
                "{} stream {} still running, waiting for it to finish",
                self.direction,
                previous.id
            );
        }
        previous.join();
        if let Some(Err(e)) = previous.outcome {
            log::warn!("{} stream {} ended with an error: {}", self.direction, previous.id, e);
        }
    }

    fn active(&mut self, id: StreamId, op: &'static str) -> Result<&mut ActiveStream, OrderingError> {
        let active = self.active.as_mut().ok_or(OrderingError::NotStarted(op))?;
        if active.id != id {
            return Err(OrderingError::UnknownStream(id));
        }
        Ok(active)
    }

    /// 流的控制句柄，可以交给其他线程（例如信号处理）
    pub fn control(&mut self, id: StreamId) -> Result<StreamControl, OrderingError> {
        Ok(self.active(id, "control")?.control.clone())
    }

    pub fn pause(&mut self, id: StreamId) -> Result<(), EngineError> {
        let direction = self.direction;
        let active = self.active(id, "pause")?;
        active.control.wait_started(STARTED_POLL);
        if active.control.is_finished() {
            log::debug!("{} stream {} already finished, pause ignored", direction, id);
            return Ok(());
        }
        active.control.request_pause();
        log::info!("Pause requested for {} stream {}", direction, id);
        Ok(())
    }

    pub fn resume(&mut self, id: StreamId) -> Result<(), EngineError> {
        let direction = self.direction;
        let active = self.active(id, "resume")?;
        active.control.wait_started(STARTED_POLL);
        active.control.request_resume();
        log::info!("Resume requested for {} stream {}", direction, id);
        Ok(())
    }

    /// 请求停止并等待循环退出，返回流的结果
    pub fn stop(&mut self, id: StreamId) -> Result<StreamReport, EngineError> {
        let active = self.active(id, "stop")?;
        active.control.request_stop();
        active.take_outcome()
    }

    /// 等待流结束并返回结果；每个流只能取回一次
    pub fn wait(&mut self, id: StreamId) -> Result<StreamReport, EngineError> {
        self.active(id, "wait")?.take_outcome()
    }

    /// 停止未结束的流并关闭设备；重复调用无副作用
    pub fn close(&mut self) {
        self.shutdown();
        self.config = None;
    }

    fn shutdown(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.control.request_stop();
            active.join();
            if let Some(Err(e)) = active.outcome {
                log::warn!("{} stream {} ended with an error: {}", self.direction, active.id, e);
            }
        }
        if let Some(device) = self.device.take() {
            device.close();
        }
    }
}

impl Drop for AudioController {
    fn drop(&mut self) {
        self.close();
    }
}

/// 播放文件的相对路径相对于 `base_dir`
fn playback_path(file: &Path, base_dir: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        base_dir.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::DeviceError;
    use crate::audio::format::BitDepth;
    use crate::audio::null_backend::NullBackend;
    use crate::config::{BackendKind, DeviceConfig, FileExistsPolicy};
    use crate::engine::source::tests::write_asset;
    use crate::engine::StreamEnd;
    use crate::pcm::{PcmError, PcmReader};
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn engine_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            device: DeviceConfig {
                backend: BackendKind::Null,
                bit_depth: BitDepth::S16,
                sample_rate: 44100,
                channels: 1,
                period_size: 1024,
                periods_per_buffer: 4,
                ..DeviceConfig::default()
            },
            dummy_mode: false,
            base_dir: dir.to_path_buf(),
        }
    }

    fn controller(direction: Direction, backend: &NullBackend) -> AudioController {
        AudioController::new(direction).with_backend(Arc::new(backend.clone()))
    }

    fn asset(dir: &Path, frames: usize) -> PathBuf {
        let path = dir.join("tone.wav");
        write_asset(&path, engine_config(dir).device.format(), frames);
        path
    }

    #[test]
    fn test_two_second_cached_playback() {
        let dir = tempfile::tempdir().unwrap();
        let path = asset(dir.path(), 88200);
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        player.init(engine_config(dir.path())).unwrap();

        let id = player.start(StartOptions::playback(&path)).unwrap();
        let report = player.wait(id).unwrap();

        assert_eq!(report.periods, 87);
        assert_eq!(report.frames, 88200);
        assert_eq!(report.end, StreamEnd::SourceExhausted);
        assert_abs_diff_eq!(report.playback_ms, 2000.0, epsilon = 1e-6);
        assert_abs_diff_eq!(report.elapsed_ms, 2000.0, epsilon = 60.0);
        assert_eq!(player.vars().number("wav_duration"), Some(2000.0));
    }

    #[test]
    fn test_duration_stops_within_one_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = asset(dir.path(), 44100);
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        player.init(engine_config(dir.path())).unwrap();

        let period_ms = engine_config(dir.path()).device.period_ms();
        let mut options = StartOptions::playback(&path);
        options.duration = StreamDuration::Millis(200);
        let id = player.start(options).unwrap();
        let report = player.wait(id).unwrap();

        assert_eq!(report.end, StreamEnd::DurationExceeded);
        assert!(report.elapsed_ms >= 200.0, "elapsed {}", report.elapsed_ms);
        assert!(
            report.elapsed_ms <= 200.0 + period_ms + 15.0,
            "elapsed {}",
            report.elapsed_ms
        );
    }

    #[test]
    fn test_background_pause_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = asset(dir.path(), 22050);
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        player.init(engine_config(dir.path())).unwrap();

        let mut options = StartOptions::playback(&path);
        options.background = true;
        let id = player.start(options).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        player.pause(id).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        player.resume(id).unwrap();
        let report = player.wait(id).unwrap();

        let period_ms = engine_config(dir.path()).device.period_ms();
        assert_eq!(report.end, StreamEnd::SourceExhausted);
        assert!(report.pause_ms >= 120.0, "paused {}", report.pause_ms);
        assert!(report.elapsed_ms - report.pause_ms <= report.playback_ms + period_ms);
    }

    #[test]
    fn test_commands_before_start_are_ordering_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        let id = StreamId(1);

        assert!(matches!(
            player.start(StartOptions::playback("a.wav")),
            Err(EngineError::Ordering(OrderingError::MissingInit(_)))
        ));

        player.init(engine_config(dir.path())).unwrap();
        assert!(matches!(
            player.pause(id),
            Err(EngineError::Ordering(OrderingError::NotStarted("pause")))
        ));
        assert!(matches!(
            player.resume(id),
            Err(EngineError::Ordering(OrderingError::NotStarted("resume")))
        ));
        assert!(matches!(
            player.stop(id),
            Err(EngineError::Ordering(OrderingError::NotStarted("stop")))
        ));
        assert!(matches!(
            player.wait(id),
            Err(EngineError::Ordering(OrderingError::NotStarted("wait")))
        ));
    }

    #[test]
    fn test_unknown_and_collected_streams() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        let mut config = engine_config(dir.path());
        config.dummy_mode = true;
        player.init(config).unwrap();

        let id = player.start(StartOptions::playback("none.wav")).unwrap();
        assert!(matches!(
            player.wait(StreamId(99)),
            Err(EngineError::Ordering(OrderingError::UnknownStream(_)))
        ));
        player.wait(id).unwrap();
        assert!(matches!(
            player.wait(id),
            Err(EngineError::Ordering(OrderingError::Collected(_)))
        ));
    }

    #[test]
    fn test_dummy_mode_makes_no_backend_calls() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NullBackend::new();
        let mut recorder = controller(Direction::Capture, &backend);
        let mut config = engine_config(dir.path());
        config.dummy_mode = true;
        recorder.init(config).unwrap();

        let mut options = StartOptions::capture("take");
        options.background = true;
        let id = recorder.start(options).unwrap();
        recorder.pause(id).unwrap();
        recorder.resume(id).unwrap();
        let report = recorder.stop(id).unwrap();

        assert_eq!(report.end, StreamEnd::Stopped);
        assert!(report.onset_ms > 0.0);
        assert!(recorder.vars().number("time_stimulus_offset_record").is_some());
        recorder.close();
        assert_eq!(backend.calls(), 0);
        assert!(!dir.path().join("take.wav").exists());
    }

    #[test]
    fn test_capture_with_suffix_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("take.wav"), b"old").unwrap();
        let backend = NullBackend::new();
        let mut recorder = controller(Direction::Capture, &backend);
        recorder.init(engine_config(dir.path())).unwrap();

        let mut options = StartOptions::capture("take");
        options.duration = StreamDuration::Millis(100);
        options.ram_cache = true;
        let id = recorder.start(options).unwrap();
        let report = recorder.wait(id).unwrap();

        let expected = dir.path().join("take_1.wav");
        assert_eq!(report.file.as_deref(), Some(expected.as_path()));
        assert_eq!(std::fs::read(dir.path().join("take.wav")).unwrap(), b"old");

        let reader = PcmReader::open(&expected).unwrap();
        assert_eq!(reader.info().frames, report.frames);
        assert!(report.frames >= 4410);
    }

    #[test]
    fn test_long_cached_capture_starts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NullBackend::new();
        let mut recorder = controller(Direction::Capture, &backend);
        recorder.init(engine_config(dir.path())).unwrap();

        // 约 28 小时，以及乘以采样率会溢出的时长
        for (name, ms) in [("day", 100_000_000), ("forever", 1_000_000_000_000_000)] {
            let mut options = StartOptions::capture(name);
            options.duration = StreamDuration::Millis(ms);
            options.ram_cache = true;
            options.background = true;
            let id = recorder.start(options).unwrap();
            std::thread::sleep(Duration::from_millis(50));

            let report = recorder.stop(id).unwrap();
            assert_eq!(report.end, StreamEnd::Stopped);
            let reader = PcmReader::open(dir.path().join(format!("{}.wav", name))).unwrap();
            assert_eq!(reader.info().frames, report.frames);
        }
    }

    #[test]
    fn test_stream_failure_surfaces_through_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = asset(dir.path(), 22050);
        let backend = NullBackend::new().with_transfer_failure(4);
        let mut player = controller(Direction::Playback, &backend);
        player.init(engine_config(dir.path())).unwrap();

        let mut options = StartOptions::playback(&path);
        options.background = true;
        let id = player.start(options.clone()).unwrap();
        assert!(matches!(
            player.wait(id),
            Err(EngineError::Stream(DeviceError::StreamFailed(_)))
        ));

        // 设备租约已释放，下一次 start 正常运行
        let id = player.start(options).unwrap();
        let report = player.wait(id).unwrap();
        assert_eq!(report.end, StreamEnd::SourceExhausted);
        assert_eq!(report.frames, 22050);
    }

    struct TrackedKeys(Arc<AtomicBool>);

    impl KeySource for TrackedKeys {
        fn poll_key(&mut self, _timeout: Duration) -> Option<String> {
            None
        }
    }

    impl Drop for TrackedKeys {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_key_source_lives_only_during_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));

        let mut player = {
            let opened = Arc::clone(&opened);
            let dropped = Arc::clone(&dropped);
            AudioController::new(Direction::Playback).with_key_source(move || {
                opened.fetch_add(1, Ordering::SeqCst);
                Some(Box::new(TrackedKeys(Arc::clone(&dropped))) as Box<dyn KeySource>)
            })
        };
        let mut config = engine_config(dir.path());
        config.dummy_mode = true;
        player.init(config).unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        // 未绑定按键时不打开按键来源
        let id = player.start(StartOptions::playback("none.wav")).unwrap();
        player.wait(id).unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        let mut options = StartOptions::playback("none.wav");
        options.stop_keys = vec!["q".to_string()];
        let id = player.start(options).unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        player.wait(id).unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_capture_option_validation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NullBackend::new();
        let mut recorder = controller(Direction::Capture, &backend);
        recorder.init(engine_config(dir.path())).unwrap();

        assert!(matches!(
            recorder.start(StartOptions::capture("take")),
            Err(EngineError::Config(ConfigError::InfiniteWithoutStop))
        ));

        let mut options = StartOptions::capture("take");
        options.duration = StreamDuration::Millis(10);
        assert!(matches!(
            recorder.start(options),
            Err(EngineError::Config(ConfigError::DurationTooShort { .. }))
        ));

        let mut options = StartOptions::capture("take");
        options.file = None;
        options.background = true;
        assert!(matches!(
            recorder.start(options),
            Err(EngineError::Config(ConfigError::MissingFile))
        ));
        assert!(!dir.path().join("take.wav").exists());
    }

    #[test]
    fn test_asset_mismatch_is_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_asset(
            &path,
            crate::audio::format::AudioFormat::new(48000, 2, BitDepth::S16),
            48000,
        );
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        player.init(engine_config(dir.path())).unwrap();

        let mut options = StartOptions::playback(&path);
        options.background = true;
        match player.start(options) {
            Err(EngineError::Asset(PcmError::Incompatible(issues))) => assert_eq!(issues.len(), 2),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            player.wait(StreamId(1)),
            Err(EngineError::Ordering(OrderingError::NotStarted(_)))
        ));
    }

    #[test]
    fn test_second_start_waits_for_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = asset(dir.path(), 8820);
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        player.init(engine_config(dir.path())).unwrap();

        let mut first = StartOptions::playback(&path);
        first.name = "a".to_string();
        first.background = true;
        player.start(first).unwrap();

        let mut second = StartOptions::playback(&path);
        second.name = "b".to_string();
        let id = player.start(second).unwrap();
        player.wait(id).unwrap();

        let vars = player.vars();
        let offset_a = vars.number("time_stimulus_offset_a").unwrap();
        let onset_b = vars.number("time_stimulus_onset_b").unwrap();
        assert!(onset_b >= offset_a);
    }

    #[test]
    fn test_init_close_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);

        player.init(engine_config(dir.path())).unwrap();
        assert!(player.device().is_some());
        assert_eq!(player.vars().number("playback_samplerate"), Some(44100.0));

        // 重复 init 先关闭旧设备
        player.init(engine_config(dir.path())).unwrap();
        assert!(player.is_initialized());

        player.close();
        player.close();
        assert!(player.device().is_none());
        assert!(matches!(
            player.start(StartOptions::playback("a.wav")),
            Err(EngineError::Ordering(OrderingError::MissingInit(_)))
        ));
    }

    #[test]
    fn test_invalid_config_rejected_before_device_io() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NullBackend::new();
        let mut player = controller(Direction::Playback, &backend);
        let mut config = engine_config(dir.path());
        config.device.channels = 0;

        assert!(matches!(
            player.init(config),
            Err(EngineError::Config(ConfigError::Zero(_)))
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_file_exists_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("take.wav"), b"old").unwrap();
        let backend = NullBackend::new();
        let mut recorder = controller(Direction::Capture, &backend);
        recorder.init(engine_config(dir.path())).unwrap();

        let mut options = StartOptions::capture("take.wav");
        options.duration = StreamDuration::Millis(50);
        options.file_exists = FileExistsPolicy::Overwrite;
        let id = recorder.start(options).unwrap();
        let report = recorder.wait(id).unwrap();

        assert_eq!(report.file, Some(dir.path().join("take.wav")));
        assert!(PcmReader::open(dir.path().join("take.wav")).is_ok());
    }
}
