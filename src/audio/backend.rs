//! 设备后端抽象
//!
//! `AudioBackend` 负责枚举和打开设备，`PcmStream` 是打开后的阻塞式流：
//! `write` 在设备接收一个 period 之前阻塞，`read` 在采集满一个 period 之前阻塞。
//! 暂停和丢弃缓冲区是可选能力。

use std::sync::Arc;

use super::format::BitDepth;
use super::stats::TransferStats;
use crate::config::{BackendKind, DeviceConfig};

/// 流方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Playback,
    Capture,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Playback => write!(f, "playback"),
            Self::Capture => write!(f, "capture"),
        }
    }
}

/// 设备错误
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),
    #[error("format not supported by '{device}': {detail}")]
    FormatUnsupported { device: String, detail: String },
    #[error("audio device busy: {0}")]
    DeviceBusy(String),
    #[error("device rejected configuration: {}", .0.join("; "))]
    ParameterMismatch(Vec<String>),
    #[error("{0} is not supported by this stream")]
    Unsupported(&'static str),
    #[error("audio stream failed: {0}")]
    StreamFailed(String),
    #[error("audio device is closed")]
    Closed,
    #[error("audio backend error: {0}")]
    Backend(String),
}

/// 枚举结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub is_default: bool,
}

/// 设备实际接受的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParams {
    pub bit_depth: BitDepth,
    pub sample_rate: u32,
    pub channels: u16,
    pub period_size: u32,
    pub periods_per_buffer: u32,
    /// period 大小由硬件决定，不可协商
    pub period_fixed: bool,
}

impl NegotiatedParams {
    /// 按请求的配置原样接受
    pub fn accepted(config: &DeviceConfig) -> Self {
        Self {
            bit_depth: config.bit_depth,
            sample_rate: config.sample_rate,
            channels: config.channels,
            period_size: config.period_size,
            periods_per_buffer: config.periods_per_buffer,
            period_fixed: false,
        }
    }
}

/// 设备后端
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> String;

    fn enumerate(&self, direction: Direction) -> Result<Vec<DeviceInfo>, DeviceError>;

    /// 打开设备流；`stats` 交给实时回调记录 underrun/overrun
    fn open(
        &self,
        direction: Direction,
        config: &DeviceConfig,
        stats: Arc<TransferStats>,
    ) -> Result<Box<dyn PcmStream>, DeviceError>;

    /// 打开播放设备前释放占用设备的系统混音器
    fn release_system_mixer(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// 打开的设备流
pub trait PcmStream: Send {
    fn negotiated(&self) -> NegotiatedParams;

    /// 写入一个 period（帧对齐），设备接收前阻塞
    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// 读满 `buf`（帧对齐），采集完成前阻塞
    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError>;

    fn supports_pause(&self) -> bool {
        false
    }

    fn pause(&mut self, _paused: bool) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("pause"))
    }

    fn supports_drop(&self) -> bool {
        false
    }

    /// 丢弃设备缓冲区中尚未播放/读取的数据
    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("drop"))
    }

    /// 关闭流；重复调用无副作用
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// 按配置创建后端
pub fn create_backend(kind: &BackendKind) -> Arc<dyn AudioBackend> {
    match kind {
        BackendKind::Cpal { host } => Arc::new(super::cpal_backend::CpalBackend::new(host.clone())),
        BackendKind::Null => Arc::new(super::null_backend::NullBackend::new()),
    }
}
