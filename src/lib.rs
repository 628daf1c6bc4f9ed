//! lowlat-audio
//!
//! 低延迟音频 I/O 引擎：按固定大小的 period 在 WAV 文件和音频设备之间
//! 实时传输数据，支持起始延迟、暂停/恢复/停止、时长限制和录音停止延迟。

pub mod audio;
pub mod config;
pub mod control;
pub mod engine;
pub mod pcm;

pub use control::{AudioController, OrderingError, StreamId};
pub use engine::{EngineError, StreamEnd, StreamReport};
