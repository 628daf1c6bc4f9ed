//! Period 数据源与录音落盘
//!
//! 播放侧 `PeriodSource` 逐个产出 period 大小的字节块：
//! - Cached：prepare 时整文件读入内存并尝试 mlock，按切片产出
//! - Streamed：每次从文件读取下一个 period，短读表示结束
//!
//! 录音侧 `CaptureSink` 逐 period 追加写入文件，或先累积在内存中、
//! 结束时一次写出。

use std::path::{Path, PathBuf};

use crate::audio::format::AudioFormat;
use crate::audio::memlock;
use crate::config::DeviceConfig;
use crate::pcm::{PcmError, PcmInfo, PcmReader, PcmWriter};

/// 锁定在内存中的整文件数据
struct CachedAsset {
    bytes: Vec<u8>,
    locked: bool,
}

impl CachedAsset {
    fn new(bytes: Vec<u8>) -> Self {
        let locked = !bytes.is_empty() && memlock::lock_region(&bytes[..]);
        Self { bytes, locked }
    }
}

impl Drop for CachedAsset {
    fn drop(&mut self) {
        if self.locked {
            memlock::unlock_region(&self.bytes[..]);
        }
    }
}

/// 播放数据源：有限、惰性、不可重来
pub struct PeriodSource {
    kind: SourceKind,
}

enum SourceKind {
    Cached {
        asset: CachedAsset,
        pos: usize,
        chunk_bytes: usize,
    },
    Streamed {
        reader: PcmReader,
        chunk_frames: usize,
        buf: Vec<u8>,
        exhausted: bool,
    },
}

impl PeriodSource {
    /// 打开播放文件并校验与设备配置是否一致
    ///
    /// 所有不一致之处合并到一个 `PcmError::Incompatible` 中报告
    pub fn open(
        path: &Path,
        config: &DeviceConfig,
        ram_cache: bool,
    ) -> Result<(Self, PcmInfo), PcmError> {
        let reader = PcmReader::open(path)?;
        let info = *reader.info();
        check_compatible(&info, config)?;

        let chunk_frames = config.period_size as usize;
        let kind = if ram_cache {
            let bytes = reader.read_all()?;
            log::info!(
                "Cached {} ({} bytes, {:.1} ms) in RAM",
                path.display(),
                bytes.len(),
                info.duration_ms()
            );
            SourceKind::Cached {
                asset: CachedAsset::new(bytes),
                pos: 0,
                chunk_bytes: config.period_bytes(),
            }
        } else {
            log::info!("Streaming {} from storage", path.display());
            SourceKind::Streamed {
                reader,
                chunk_frames,
                buf: Vec::new(),
                exhausted: false,
            }
        };

        Ok((Self { kind }, info))
    }

    /// 下一个块；数据耗尽后返回 `None`
    ///
    /// 除最后一块外都是完整的 period，最后一块可能较短
    pub fn next_chunk(&mut self) -> Result<Option<&[u8]>, PcmError> {
        match &mut self.kind {
            SourceKind::Cached {
                asset,
                pos,
                chunk_bytes,
            } => {
                let len = asset.bytes.len();
                if *pos >= len {
                    return Ok(None);
                }
                let start = *pos;
                let end = (start + *chunk_bytes).min(len);
                *pos = end;
                Ok(Some(&asset.bytes[start..end]))
            }
            SourceKind::Streamed {
                reader,
                chunk_frames,
                buf,
                exhausted,
            } => {
                if *exhausted {
                    return Ok(None);
                }
                *buf = reader.read_frames(*chunk_frames)?;
                let frame_bytes = reader.info().format.bytes_per_frame();
                if buf.len() < *chunk_frames * frame_bytes {
                    *exhausted = true;
                }
                if buf.is_empty() {
                    return Ok(None);
                }
                Ok(Some(&buf[..]))
            }
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.kind, SourceKind::Cached { .. })
    }
}

fn check_compatible(info: &PcmInfo, config: &DeviceConfig) -> Result<(), PcmError> {
    let file = &info.format;
    let mut issues = Vec::new();

    if file.bit_depth != config.bit_depth {
        issues.push(format!(
            "file is {}, device is {}",
            file.bit_depth, config.bit_depth
        ));
    }
    if file.sample_rate != config.sample_rate {
        issues.push(format!(
            "file sample rate is {} Hz, device is {} Hz",
            file.sample_rate, config.sample_rate
        ));
    }
    if file.channels != config.channels {
        issues.push(format!(
            "file has {} channels, device has {}",
            file.channels, config.channels
        ));
    }
    if info.frames < config.period_size as u64 {
        issues.push(format!(
            "file holds {} frames, less than one period ({} frames)",
            info.frames, config.period_size
        ));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(PcmError::Incompatible(issues))
    }
}

/// RAM 录音预先保留的内存上限，超出后按 period 增长
const MAX_RESERVE_BYTES: u64 = 64 * 1024 * 1024;

/// 录音目标
pub struct CaptureSink {
    writer: PcmWriter,
    cache: Option<Vec<u8>>,
}

impl CaptureSink {
    /// 创建目标文件；`ram_cache` 时数据先累积在内存中
    ///
    /// `expected_frames` 已知时预留内存（不超过 `MAX_RESERVE_BYTES`），
    /// 减少录音中途扩容
    pub fn create(
        path: &Path,
        format: AudioFormat,
        ram_cache: bool,
        expected_frames: Option<u64>,
    ) -> Result<Self, PcmError> {
        let writer = PcmWriter::create(path, format)?;
        let cache = ram_cache.then(|| {
            let wanted = expected_frames
                .unwrap_or(0)
                .saturating_mul(format.bytes_per_frame() as u64)
                .min(MAX_RESERVE_BYTES) as usize;
            let mut cache = Vec::new();
            if let Err(e) = cache.try_reserve_exact(wanted) {
                log::warn!("Could not reserve {} bytes for the recording: {}", wanted, e);
            }
            cache
        });
        Ok(Self { writer, cache })
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// 追加一个 period
    pub fn push(&mut self, period: &[u8]) -> Result<(), PcmError> {
        match self.cache.as_mut() {
            Some(cache) => {
                cache
                    .try_reserve(period.len())
                    .map_err(|_| PcmError::CacheFull { bytes: period.len() })?;
                cache.extend_from_slice(period);
                Ok(())
            }
            None => self.writer.write_frames(period),
        }
    }

    /// 写出内存中的数据并完成文件头，返回 (路径, 总帧数)
    pub fn finish(mut self) -> Result<(PathBuf, u64), PcmError> {
        if let Some(cache) = self.cache.take() {
            self.writer.write_frames(&cache)?;
        }
        let path = self.writer.path().to_path_buf();
        let frames = self.writer.finalize()?;
        log::info!("Recorded {} frames to {}", frames, path.display());
        Ok((path, frames))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::format::BitDepth;
    use crate::config::BackendKind;

    /// 写一个帧内容递增的测试文件
    pub(crate) fn write_asset(path: &Path, format: AudioFormat, frames: usize) {
        let mut writer = PcmWriter::create(path, format).unwrap();
        let samples: Vec<i32> = (0..frames * format.channels as usize)
            .map(|i| (i % 100) as i32)
            .collect();
        let mut bytes = Vec::new();
        format.samples_to_bytes(&samples, &mut bytes);
        writer.write_frames(&bytes).unwrap();
        writer.finalize().unwrap();
    }

    fn device(period_size: u32) -> DeviceConfig {
        DeviceConfig {
            backend: BackendKind::Null,
            channels: 1,
            period_size,
            ..DeviceConfig::default()
        }
    }

    fn collect(source: &mut PeriodSource) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            sizes.push(chunk.len());
        }
        sizes
    }

    #[test]
    fn test_chunk_count_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let config = device(100);
        write_asset(&path, config.format(), 1050);

        for ram_cache in [true, false] {
            let (mut source, info) = PeriodSource::open(&path, &config, ram_cache).unwrap();
            assert_eq!(source.is_cached(), ram_cache);
            assert_eq!(info.frames, 1050);

            let sizes = collect(&mut source);
            // ⌈1050 / 100⌉ 个块，最后一块 50 帧
            assert_eq!(sizes.len(), 11);
            assert!(sizes[..10].iter().all(|&s| s == 200));
            assert_eq!(sizes[10], 100);
            assert_eq!(sizes.iter().sum::<usize>(), 2100);
            assert!(source.next_chunk().unwrap().is_none());
        }
    }

    #[test]
    fn test_exact_multiple_has_no_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("even.wav");
        let config = device(100);
        write_asset(&path, config.format(), 300);

        for ram_cache in [true, false] {
            let (mut source, _) = PeriodSource::open(&path, &config, ram_cache).unwrap();
            assert_eq!(collect(&mut source), vec![200, 200, 200]);
        }
    }

    #[test]
    fn test_cached_and_streamed_bytes_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same.wav");
        let config = device(64);
        write_asset(&path, config.format(), 500);

        let read = |ram_cache| {
            let (mut source, _) = PeriodSource::open(&path, &config, ram_cache).unwrap();
            let mut all = Vec::new();
            while let Some(chunk) = source.next_chunk().unwrap() {
                all.extend_from_slice(chunk);
            }
            all
        };
        assert_eq!(read(true), read(false));
    }

    #[test]
    fn test_mismatches_reported_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrong.wav");
        write_asset(&path, AudioFormat::new(48000, 2, BitDepth::S24), 10);

        let err = PeriodSource::open(&path, &device(1024), true).err().unwrap();
        match err {
            PcmError::Incompatible(issues) => assert_eq!(issues.len(), 4),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_asset() {
        let dir = tempfile::tempdir().unwrap();
        let result = PeriodSource::open(&dir.path().join("none.wav"), &device(64), true);
        assert!(matches!(result, Err(PcmError::FileNotFound(_))));
    }

    #[test]
    fn test_capture_sink_cached_writes_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.wav");
        let format = AudioFormat::new(8000, 1, BitDepth::S16);

        let mut sink = CaptureSink::create(&path, format, true, Some(400)).unwrap();
        sink.push(&[1, 0, 2, 0]).unwrap();
        sink.push(&[3, 0]).unwrap();
        let (written, frames) = sink.finish().unwrap();
        assert_eq!(written, path);
        assert_eq!(frames, 3);

        let reader = PcmReader::open(&path).unwrap();
        assert_eq!(reader.read_all().unwrap(), vec![1, 0, 2, 0, 3, 0]);
    }

    #[test]
    fn test_capture_sink_reservation_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let format = AudioFormat::new(44100, 2, BitDepth::S32);

        let sink = CaptureSink::create(&dir.path().join("a.wav"), format, true, Some(400)).unwrap();
        assert!(sink.cache.as_ref().unwrap().capacity() >= 3200);

        // 约 28 小时 / 溢出的帧数都只保留上限
        for frames in [44_100 * 100_000, u64::MAX] {
            let sink =
                CaptureSink::create(&dir.path().join("b.wav"), format, true, Some(frames)).unwrap();
            let capacity = sink.cache.as_ref().unwrap().capacity() as u64;
            assert!(capacity <= MAX_RESERVE_BYTES, "capacity {}", capacity);
        }
    }

    #[test]
    fn test_capture_sink_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.wav");
        let format = AudioFormat::new(8000, 2, BitDepth::U8);

        let mut sink = CaptureSink::create(&path, format, false, None).unwrap();
        for _ in 0..4 {
            sink.push(&[0x80; 20]).unwrap();
        }
        let (_, frames) = sink.finish().unwrap();
        assert_eq!(frames, 40);
    }
}
