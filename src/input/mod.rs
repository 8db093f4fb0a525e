/// 视频输入系统 (Video Input System)
///
/// 独立工作线程,负责拉流、重连与帧分发
/// - Connection:  单次连接接口
/// - Manager:     带重试上限的连接状态机
/// - FrameSlot:   定长帧通道 (满时替换最旧帧)
/// - Acquisition: 采集循环 (帧率限制)
/// - Ffmpeg:      ffmpeg 子进程拉流
/// - Native:      ez-ffmpeg 进程内拉流 (可选)
pub mod acquisition;
pub mod connection;
pub mod ffmpeg;
pub mod frame_slot;
pub mod manager;
#[cfg(feature = "ffmpeg-native")]
pub mod native;

pub use acquisition::FrameAcquisitionLoop;
pub use connection::{Connector, StreamConnection, StreamProperties};
pub use ffmpeg::{FfmpegConnection, FfmpegConnector};
pub use frame_slot::{frame_channel, FrameReceiver, FrameRecv, FrameSender, PushOutcome};
pub use manager::{ConnectionManager, ConnectionMonitor, ConnectionState, ConnectionStatus};
#[cfg(feature = "ffmpeg-native")]
pub use native::{NativeConnection, NativeConnector};
