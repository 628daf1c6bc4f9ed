//! WAV 读取

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::{PcmError, PcmInfo};
use crate::audio::format::{AudioFormat, BitDepth};

/// 顺序读取 WAV 文件的帧
pub struct PcmReader {
    path: PathBuf,
    info: PcmInfo,
    reader: hound::WavReader<BufReader<File>>,
    /// 复用的样本缓冲区
    samples: Vec<i32>,
}

impl PcmReader {
    /// 打开文件并解析头部
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PcmError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PcmError::FileNotFound(path.to_path_buf()));
        }

        let format_error = |reason: String| PcmError::Format {
            path: path.to_path_buf(),
            reason,
        };

        let reader = hound::WavReader::open(path).map_err(|e| format_error(e.to_string()))?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int {
            return Err(format_error("floating-point samples are not supported".to_string()));
        }
        let bit_depth = BitDepth::try_from(spec.bits_per_sample)
            .map_err(|_| format_error(format!("unsupported bit depth {}", spec.bits_per_sample)))?;

        let info = PcmInfo {
            format: AudioFormat::new(spec.sample_rate, spec.channels, bit_depth),
            frames: reader.duration() as u64,
        };

        log::debug!(
            "Opened {}: {}Hz {}ch {}, {} frames ({:.1} ms)",
            path.display(),
            spec.sample_rate,
            spec.channels,
            bit_depth,
            info.frames,
            info.duration_ms()
        );

        Ok(Self {
            path: path.to_path_buf(),
            info,
            reader,
            samples: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &PcmInfo {
        &self.info
    }

    /// 读取最多 `frames` 帧
    ///
    /// 文件末尾返回较短的块，读完后返回空块；不补零
    pub fn read_frames(&mut self, frames: usize) -> Result<Vec<u8>, PcmError> {
        let format = self.info.format;
        let wanted = frames * format.channels as usize;

        self.samples.clear();
        for sample in self.reader.samples::<i32>().take(wanted) {
            self.samples.push(sample?);
        }
        // 丢弃末尾不完整的帧
        let whole = self.samples.len() - self.samples.len() % format.channels as usize;
        self.samples.truncate(whole);

        let mut bytes = Vec::with_capacity(whole * format.bytes_per_sample());
        format.samples_to_bytes(&self.samples, &mut bytes);
        Ok(bytes)
    }

    /// 读取剩余全部帧
    pub fn read_all(mut self) -> Result<Vec<u8>, PcmError> {
        let frames = self.info.frames as usize;
        self.read_frames(frames)
    }
}
