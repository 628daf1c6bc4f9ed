//! 流引擎
//!
//! 一次 `start` 对应一个流：等待起始延迟、逐 period 在数据源和设备之间
//! 传输、响应暂停/恢复/停止、检查时长，最后记录 offset 并收尾。
//! 前台和后台运行的是同一个循环，后台在命名工作线程里执行。

pub mod control;
pub mod keys;
pub mod source;
mod transfer;
pub mod vars;

use std::path::PathBuf;

use crate::audio::backend::DeviceError;
use crate::audio::stats::StatsReport;
use crate::config::ConfigError;
use crate::control::OrderingError;
use crate::pcm::PcmError;

pub use control::StreamControl;
pub use keys::{KeyAction, KeyBindings, KeyPress, KeySource, TerminalKeys};
pub use source::{CaptureSink, PeriodSource};
pub(crate) use transfer::{StreamData, StreamJob};
pub use vars::{HostVars, VarValue};

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Asset(#[from] PcmError),
    #[error(transparent)]
    Ordering(#[from] OrderingError),
    /// 传输中途的设备读写失败
    #[error("stream failed mid-transfer: {0}")]
    Stream(#[source] DeviceError),
    /// 录音文件写入失败
    #[error("failed to write recording: {0}")]
    Record(#[source] PcmError),
    #[error("stream worker panicked")]
    WorkerPanicked,
    #[error("failed to spawn stream worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// 流的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// 播放到文件末尾
    SourceExhausted,
    DurationExceeded,
    /// 停止命令或停止键
    Stopped,
}

impl std::fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceExhausted => write!(f, "end of audio"),
            Self::DurationExceeded => write!(f, "duration exceeded"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// 一次流的结果
///
/// 时间均为主机时钟毫秒
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub name: String,
    pub onset_ms: f64,
    pub offset_ms: f64,
    /// offset − onset（包含暂停）
    pub elapsed_ms: f64,
    pub pause_ms: f64,
    /// 实际传输的帧对应的音频时长
    pub playback_ms: f64,
    /// 播放结束后等待设备缓冲区播完的时长
    pub wait_to_finish_ms: f64,
    pub periods: u64,
    pub frames: u64,
    pub end: StreamEnd,
    pub duration_exceeded: bool,
    pub period_timestamps: Vec<f64>,
    pub key_presses: Vec<KeyPress>,
    pub stats: StatsReport,
    /// 录音文件的最终路径
    pub file: Option<PathBuf>,
}

impl std::fmt::Display for StreamReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stream '{}' ({})", self.name, self.end)?;
        writeln!(f, "  Onset:    {:.3} ms", self.onset_ms)?;
        writeln!(f, "  Offset:   {:.3} ms", self.offset_ms)?;
        writeln!(f, "  Elapsed:  {:.1} ms", self.elapsed_ms)?;
        writeln!(f, "  Paused:   {:.1} ms", self.pause_ms)?;
        writeln!(f, "  Audio:    {:.1} ms ({} frames)", self.playback_ms, self.frames)?;
        writeln!(f, "  Periods:  {}", self.periods)?;
        if let Some(file) = &self.file {
            writeln!(f, "  File:     {}", file.display())?;
        }
        for press in &self.key_presses {
            writeln!(f, "  Key '{}' at {:.3} ms", press.key, press.time_ms)?;
        }
        Ok(())
    }
}
