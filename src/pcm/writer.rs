//! WAV 写入

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::PcmError;
use crate::audio::format::AudioFormat;

/// 追加写入 WAV 文件，`finalize` 时写入最终帧数
pub struct PcmWriter {
    path: PathBuf,
    format: AudioFormat,
    writer: hound::WavWriter<BufWriter<File>>,
    frames: u64,
    samples: Vec<i32>,
}

impl PcmWriter {
    /// 创建文件，父目录不存在时自动创建
    pub fn create<P: AsRef<Path>>(path: P, format: AudioFormat) -> Result<Self, PcmError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                std::fs::create_dir_all(parent).map_err(|source| PcmError::Path {
                    path: parent.to_path_buf(),
                    source,
                })?;
                log::info!("Created directory {}", parent.display());
            }
        }

        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bit_depth.bits(),
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)?;

        log::debug!(
            "Writing {}: {}Hz {}ch {}",
            path.display(),
            format.sample_rate,
            format.channels,
            format.bit_depth
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            writer,
            frames: 0,
            samples: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// 已写入的帧数
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// 追加帧对齐的原始字节
    pub fn write_frames(&mut self, bytes: &[u8]) -> Result<(), PcmError> {
        let frame_bytes = self.format.bytes_per_frame();
        if bytes.len() % frame_bytes != 0 {
            return Err(PcmError::Misaligned {
                bytes: bytes.len(),
                frame_bytes,
            });
        }

        self.samples.clear();
        self.format.bytes_to_samples(bytes, &mut self.samples);
        for &sample in &self.samples {
            self.writer.write_sample(sample)?;
        }

        self.frames += (bytes.len() / frame_bytes) as u64;
        Ok(())
    }

    /// 写入最终头部并关闭文件，返回总帧数
    pub fn finalize(self) -> Result<u64, PcmError> {
        self.writer.finalize()?;
        log::debug!("Finalized {} ({} frames)", self.path.display(), self.frames);
        Ok(self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::BitDepth;
    use crate::pcm::PcmReader;

    fn synthetic(format: &AudioFormat, frames: usize) -> Vec<u8> {
        let samples: Vec<i32> = (0..frames * format.channels as usize)
            .map(|i| {
                let max = match format.bit_depth {
                    BitDepth::U8 => 127,
                    BitDepth::S16 => i16::MAX as i32,
                    BitDepth::S24 => 0x7F_FFFF,
                    BitDepth::S32 => i32::MAX,
                };
                // 正负交替的锯齿
                let v = (i as i64 * 7919 % (max as i64 + 1)) as i32;
                if i % 2 == 0 { v } else { -v }
            })
            .collect();
        let mut bytes = Vec::new();
        format.samples_to_bytes(&samples, &mut bytes);
        bytes
    }

    #[test]
    fn test_roundtrip_all_depths() {
        let dir = tempfile::tempdir().unwrap();

        for (bit_depth, channels) in [
            (BitDepth::U8, 1),
            (BitDepth::S16, 2),
            (BitDepth::S24, 2),
            (BitDepth::S32, 3),
        ] {
            let format = AudioFormat::new(44100, channels, bit_depth);
            let path = dir.path().join(format!("rt_{}.wav", bit_depth.bits()));
            let data = synthetic(&format, 1000);

            let mut writer = PcmWriter::create(&path, format).unwrap();
            // 分两次写入
            let half = format.frames_to_bytes(600);
            writer.write_frames(&data[..half]).unwrap();
            writer.write_frames(&data[half..]).unwrap();
            assert_eq!(writer.finalize().unwrap(), 1000);

            let reader = PcmReader::open(&path).unwrap();
            assert_eq!(reader.info().frames, 1000);
            assert_eq!(reader.info().format, format);
            assert_eq!(reader.read_all().unwrap(), data, "{} mismatch", bit_depth);
        }
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session/one/take.wav");
        let format = AudioFormat::new(8000, 1, BitDepth::S16);

        let writer = PcmWriter::create(&path, format).unwrap();
        writer.finalize().unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let format = AudioFormat::new(8000, 1, BitDepth::S16);

        let result = PcmWriter::create(blocker.join("take.wav"), format);
        assert!(matches!(result, Err(PcmError::Path { .. })));
    }

    #[test]
    fn test_misaligned_write() {
        let dir = tempfile::tempdir().unwrap();
        let format = AudioFormat::new(8000, 2, BitDepth::S16);
        let mut writer = PcmWriter::create(dir.path().join("m.wav"), format).unwrap();
        assert!(matches!(
            writer.write_frames(&[0u8; 6]),
            Err(PcmError::Misaligned { bytes: 6, frame_bytes: 4 })
        ));
    }
}
