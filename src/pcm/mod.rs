//! PCM 容器读写
//!
//! 只处理 RIFF/WAVE 整数 PCM：8-bit 无符号，16/24/32-bit 有符号，little-endian。
//! 对外以帧对齐的原始字节交换数据，与设备流的字节布局一致。

mod path;
mod reader;
mod writer;

use std::path::PathBuf;

use crate::audio::format::AudioFormat;

pub use path::{apply_file_policy, next_free_path, resolve_output_path};
pub use reader::PcmReader;
pub use writer::PcmWriter;

/// 音频文件错误
#[derive(Debug, thiserror::Error)]
pub enum PcmError {
    #[error("audio file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("invalid WAV file {path}: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("cannot create directory {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write of {bytes} bytes is not aligned to the {frame_bytes}-byte frame")]
    Misaligned { bytes: usize, frame_bytes: usize },
    #[error("audio file does not match the device: {}", .0.join("; "))]
    Incompatible(Vec<String>),
    #[error("recording cache cannot grow by {bytes} bytes")]
    CacheFull { bytes: usize },
    #[error("WAV I/O error: {0}")]
    Io(#[from] hound::Error),
}

/// 文件元数据
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcmInfo {
    pub format: AudioFormat,
    /// 总帧数
    pub frames: u64,
}

impl PcmInfo {
    /// 时长（毫秒）
    pub fn duration_ms(&self) -> f64 {
        self.format.frames_to_ms(self.frames)
    }

    /// 字节数
    pub fn byte_len(&self) -> usize {
        self.format.frames_to_bytes(self.frames as usize)
    }
}
