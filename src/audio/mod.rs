//! 音频设备层
//!
//! 包含：
//! - Backend: 设备后端抽象，cpal 主机 API 和无硬件的 null 设备
//! - Device: 设备会话与独占租约
//! - Ring Buffer: 阻塞读写与实时回调之间的 lock-free 数据传递
//! - Format: 音频格式和样本编解码
//! - Timing: 主机毫秒时钟
//! - Stats: 传输统计

pub mod backend;
pub mod cpal_backend;
pub mod device;
pub mod format;
pub mod memlock;
pub mod null_backend;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use backend::{create_backend, AudioBackend, DeviceError, DeviceInfo, Direction, PcmStream};
pub use device::{DeviceSession, DeviceState};
pub use format::{AudioFormat, BitDepth};
pub use null_backend::NullBackend;
pub use ring_buffer::RingBuffer;
pub use stats::{StatsReport, TransferStats};
pub use timing::Clock;
