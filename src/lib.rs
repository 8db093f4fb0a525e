// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 流 / 历史 / 流水线配置
pub mod detection; // 检测编排, 轨迹历史, 测速
pub mod diagnostics; // 连接诊断
pub mod error; // 错误类型
pub mod input; // 视频输入与连接管理
pub mod pipeline; // 采集 + 处理双线程流水线

pub use crate::config::{HistoryConfig, PipelineConfig, StreamConfig};
pub use crate::detection::{
    DetectionOrchestrator, DetectionResult, Frame, ObjectDetector, TrackedVehicle, Tracker,
};
pub use crate::error::{ConfigError, DispatchError, ModelError, PipelineError, StreamError};
pub use crate::input::{ConnectionManager, ConnectionState};
pub use crate::pipeline::{Pipeline, PipelineBuilder, PipelineHandle};

/// 本地时间字符串, 用于报告文件命名
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%3f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}
