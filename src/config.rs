//! 配置
//!
//! 设备参数（`DeviceConfig`）、引擎参数（`EngineConfig`）和单次流参数
//! （`StartOptions`）。字符串形式的选项都实现了 `FromStr`，供 CLI 解析。

use std::path::PathBuf;
use std::str::FromStr;

use crate::audio::format::{AudioFormat, BitDepth};

/// 配置错误：在任何设备 I/O 之前报告
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported bit depth {0} (expected 8, 16, 24 or 32)")]
    BitDepth(u16),
    #[error("{0} must be greater than 0")]
    Zero(&'static str),
    #[error("invalid duration '{0}': expected a positive integer (ms), 'sound' or 'infinite'")]
    Duration(String),
    #[error("invalid {field} '{value}': expected a non-negative integer (ms)")]
    Millis { field: &'static str, value: String },
    #[error("invalid {field} '{value}': expected yes/no or true/false")]
    Flag { field: &'static str, value: String },
    #[error("invalid file-exists policy '{0}': expected 'overwrite' or 'suffix'")]
    Policy(String),
    #[error("duration {duration_ms} ms is shorter than one period ({period_ms:.2} ms)")]
    DurationTooShort { duration_ms: u64, period_ms: f64 },
    #[error("an infinite foreground capture needs at least one stop key")]
    InfiniteWithoutStop,
    #[error("no audio file given")]
    MissingFile,
}

/// 设备后端
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// cpal 主机 API；`None` 为平台默认主机，否则按名称选择（alsa、jack、coreaudio、wasapi…）
    Cpal { host: Option<String> },
    /// 无硬件的实时节拍设备
    Null,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Cpal { host: None }
    }
}

impl FromStr for BackendKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Ok(match name.as_str() {
            "null" => Self::Null,
            "" | "default" | "cpal" => Self::Cpal { host: None },
            _ => Self::Cpal { host: Some(name) },
        })
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpal { host: None } => write!(f, "cpal"),
            Self::Cpal { host: Some(host) } => write!(f, "cpal/{}", host),
            Self::Null => write!(f, "null"),
        }
    }
}

/// 设备配置
///
/// 打开后不可变（硬件固定 period 的后端除外，见 `DeviceSession::open`）
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    /// 设备名；`None` 使用默认设备
    pub device_id: Option<String>,
    pub bit_depth: BitDepth,
    pub sample_rate: u32,
    pub channels: u16,
    /// 每个 period 的帧数
    pub period_size: u32,
    /// 设备缓冲区包含的 period 数
    pub periods_per_buffer: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            device_id: None,
            bit_depth: BitDepth::S16,
            sample_rate: 44100,
            channels: 2,
            period_size: 1024,
            periods_per_buffer: 4,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Zero("sample rate"));
        }
        if self.channels == 0 {
            return Err(ConfigError::Zero("channel count"));
        }
        if self.period_size == 0 {
            return Err(ConfigError::Zero("period size"));
        }
        if self.periods_per_buffer == 0 {
            return Err(ConfigError::Zero("periods per buffer"));
        }
        Ok(())
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.bit_depth)
    }

    /// 一个 period 的字节数
    pub fn period_bytes(&self) -> usize {
        self.format().frames_to_bytes(self.period_size as usize)
    }

    /// 一个 period 的时长（毫秒，精确值）
    pub fn period_ms(&self) -> f64 {
        self.period_size as f64 / self.sample_rate as f64 * 1000.0
    }

    /// 设备缓冲区帧数
    pub fn buffer_frames(&self) -> u32 {
        self.period_size * self.periods_per_buffer
    }
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    /// 只模拟时序，不调用任何设备后端
    pub dummy_mode: bool,
    /// 录音相对路径的基准目录
    pub base_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            dummy_mode: false,
            base_dir: PathBuf::from("."),
        }
    }
}

/// 流时长
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamDuration {
    /// 自然结束：播放到文件末尾（`sound`）或录到停止为止（`infinite`）
    Natural,
    Millis(u64),
}

impl StreamDuration {
    pub fn millis(&self) -> Option<u64> {
        match self {
            Self::Natural => None,
            Self::Millis(ms) => Some(*ms),
        }
    }
}

impl FromStr for StreamDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("sound") || s.eq_ignore_ascii_case("infinite") {
            return Ok(Self::Natural);
        }
        match s.parse::<u64>() {
            Ok(ms) if ms >= 1 => Ok(Self::Millis(ms)),
            _ => Err(ConfigError::Duration(s.to_string())),
        }
    }
}

impl std::fmt::Display for StreamDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Natural => write!(f, "natural end"),
            Self::Millis(ms) => write!(f, "{} ms", ms),
        }
    }
}

/// 目标文件已存在时的处理
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileExistsPolicy {
    Overwrite,
    /// 追加 `_1`、`_2` … 直到文件名未被占用
    Suffix,
}

impl FromStr for FileExistsPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "suffix" => Ok(Self::Suffix),
            _ => Err(ConfigError::Policy(s.to_string())),
        }
    }
}

/// 单次 start 的参数
#[derive(Clone, Debug)]
pub struct StartOptions {
    /// 时间戳变量名后缀
    pub name: String,
    pub file: Option<PathBuf>,
    pub duration: StreamDuration,
    pub delay_ms: u64,
    /// 仅录音：停止后继续采集的时长
    pub stop_delay_ms: u64,
    pub ram_cache: bool,
    pub pause_keys: Vec<String>,
    pub stop_keys: Vec<String>,
    pub file_exists: FileExistsPolicy,
    /// 在后台工作线程中运行
    pub background: bool,
    /// 记录每个 period 的时间戳
    pub period_timestamps: bool,
}

impl StartOptions {
    /// 播放默认值：播放到文件末尾，整文件缓存到内存
    pub fn playback(file: impl Into<PathBuf>) -> Self {
        Self {
            name: "play".to_string(),
            file: Some(file.into()),
            duration: StreamDuration::Natural,
            delay_ms: 0,
            stop_delay_ms: 0,
            ram_cache: true,
            pause_keys: Vec::new(),
            stop_keys: Vec::new(),
            file_exists: FileExistsPolicy::Overwrite,
            background: false,
            period_timestamps: false,
        }
    }

    /// 录音默认值：录到停止为止，逐 period 写盘，已存在时加后缀
    pub fn capture(file: impl Into<PathBuf>) -> Self {
        Self {
            name: "record".to_string(),
            ram_cache: false,
            file_exists: FileExistsPolicy::Suffix,
            ..Self::playback(file)
        }
    }
}

/// 解析 yes/no、true/false（大小写不敏感）
pub fn parse_flag(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::Flag {
            field,
            value: value.to_string(),
        }),
    }
}

/// 解析非负毫秒数
pub fn parse_millis(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::Millis {
        field,
        value: value.to_string(),
    })
}

/// 解析 `;` 分隔的按键列表，丢弃空项
pub fn parse_key_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_default() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.period_bytes(), 1024 * 4);
        assert_eq!(config.buffer_frames(), 4096);
        assert!((config.period_ms() - 23.219_954).abs() < 1e-3);
    }

    #[test]
    fn test_device_config_rejects_zero() {
        let config = DeviceConfig {
            period_size: 0,
            ..DeviceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("period size"))
        ));
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!("sound".parse::<StreamDuration>().unwrap(), StreamDuration::Natural);
        assert_eq!("Infinite".parse::<StreamDuration>().unwrap(), StreamDuration::Natural);
        assert_eq!("250".parse::<StreamDuration>().unwrap(), StreamDuration::Millis(250));
        assert!("0".parse::<StreamDuration>().is_err());
        assert!("-5".parse::<StreamDuration>().is_err());
        assert!("1.5".parse::<StreamDuration>().is_err());
    }

    #[test]
    fn test_flag_parse_case_insensitive() {
        assert!(!parse_flag("ram_cache", "No").unwrap());
        assert!(parse_flag("ram_cache", "YES").unwrap());
        assert!(parse_flag("ram_cache", "maybe").is_err());
    }

    #[test]
    fn test_millis_parse() {
        assert_eq!(parse_millis("delay", " 100 ").unwrap(), 100);
        assert!(parse_millis("delay", "-1").is_err());
    }

    #[test]
    fn test_key_list_parse() {
        assert_eq!(parse_key_list("space;p;;q "), vec!["space", "p", "q"]);
        assert!(parse_key_list("").is_empty());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("null".parse::<BackendKind>().unwrap(), BackendKind::Null);
        assert_eq!(
            "ALSA".parse::<BackendKind>().unwrap(),
            BackendKind::Cpal {
                host: Some("alsa".to_string())
            }
        );
        assert_eq!(
            "default".parse::<BackendKind>().unwrap(),
            BackendKind::Cpal { host: None }
        );
    }

    #[test]
    fn test_capture_defaults() {
        let options = StartOptions::capture("take.wav");
        assert_eq!(options.name, "record");
        assert!(!options.ram_cache);
        assert_eq!(options.file_exists, FileExistsPolicy::Suffix);
        assert_eq!(options.duration, StreamDuration::Natural);
    }
}
