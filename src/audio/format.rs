//! 音频格式和样本编解码
//!
//! 字节表示：WAV 与设备流一致，little-endian 交织
//! - 8-bit: 无符号（offset binary，静音 = 0x80）
//! - 16/24/32-bit: 有符号补码
//!
//! 样本表示：i32 右对齐，8-bit 转为有符号 -128..=127

use crate::config::ConfigError;

/// 支持的位深
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BitDepth {
    U8,
    S16,
    S24,
    S32,
}

impl BitDepth {
    /// 位数
    #[inline]
    pub fn bits(self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::S16 => 16,
            Self::S24 => 24,
            Self::S32 => 32,
        }
    }

    /// 每样本字节数
    #[inline]
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }
}

impl TryFrom<u16> for BitDepth {
    type Error = ConfigError;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(Self::U8),
            16 => Ok(Self::S16),
            24 => Ok(Self::S24),
            32 => Ok(Self::S32),
            other => Err(ConfigError::BitDepth(other)),
        }
    }
}

impl std::fmt::Display for BitDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: BitDepth,
}

impl AudioFormat {
    /// 创建新的音频格式
    pub fn new(sample_rate: u32, channels: u16, bit_depth: BitDepth) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bit_depth.bytes()
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bit_depth.bytes() * self.channels as usize
    }

    #[inline]
    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.bytes_per_frame()
    }

    #[inline]
    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        bytes / self.bytes_per_frame()
    }

    /// 帧数对应的时长（毫秒，精确值）
    #[inline]
    pub fn frames_to_ms(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64 * 1000.0
    }

    /// 用静音填充字节缓冲区
    pub fn fill_silence(&self, output: &mut [u8]) {
        let value = match self.bit_depth {
            BitDepth::U8 => 0x80,
            _ => 0x00,
        };
        output.fill(value);
    }

    /// 将原始字节解码为 i32 样本（右对齐）
    ///
    /// 末尾不足一个样本的字节被忽略，返回解码的样本数
    pub fn bytes_to_samples(&self, bytes: &[u8], output: &mut Vec<i32>) -> usize {
        let before = output.len();
        match self.bit_depth {
            BitDepth::U8 => {
                output.extend(bytes.iter().map(|&b| b as i32 - 128));
            }
            BitDepth::S16 => {
                output.extend(
                    bytes
                        .chunks_exact(2)
                        .map(|c| i16::from_le_bytes([c[0], c[1]]) as i32),
                );
            }
            BitDepth::S24 => {
                output.extend(bytes.chunks_exact(3).map(|c| {
                    // chunk[0] = LSB, chunk[2] = MSB (含符号位)
                    let raw = (c[0] as i32) | ((c[1] as i32) << 8) | ((c[2] as i32) << 16);
                    // 符号扩展 24-bit → 32-bit
                    (raw << 8) >> 8
                }));
            }
            BitDepth::S32 => {
                output.extend(
                    bytes
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }
        }
        output.len() - before
    }

    /// 将 i32 样本（右对齐）打包为字节，追加到 output
    pub fn samples_to_bytes(&self, samples: &[i32], output: &mut Vec<u8>) {
        output.reserve(samples.len() * self.bytes_per_sample());
        match self.bit_depth {
            BitDepth::U8 => {
                output.extend(samples.iter().map(|&s| (s + 128) as u8));
            }
            BitDepth::S16 => {
                for &s in samples {
                    output.extend_from_slice(&(s as i16).to_le_bytes());
                }
            }
            BitDepth::S24 => {
                for &s in samples {
                    output.extend_from_slice(&s.to_le_bytes()[..3]);
                }
            }
            BitDepth::S32 => {
                for &s in samples {
                    output.extend_from_slice(&s.to_le_bytes());
                }
            }
        }
    }
}

/// 设备回调中的原生样本类型
///
/// 回调缓冲区是类型化的，ring buffer 中是 little-endian 字节
pub trait PcmSample: Copy + Send + 'static {
    const BYTES: usize;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, output: &mut [u8]);
}

impl PcmSample for u8 {
    const BYTES: usize = 1;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }

    #[inline]
    fn write_le(self, output: &mut [u8]) {
        output[0] = self;
    }
}

impl PcmSample for i16 {
    const BYTES: usize = 2;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        i16::from_le_bytes([bytes[0], bytes[1]])
    }

    #[inline]
    fn write_le(self, output: &mut [u8]) {
        output[..2].copy_from_slice(&self.to_le_bytes());
    }
}

impl PcmSample for i32 {
    const BYTES: usize = 4;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[inline]
    fn write_le(self, output: &mut [u8]) {
        output[..4].copy_from_slice(&self.to_le_bytes());
    }
}
