/// 检测系统 (Detection System)
///
/// 处理线程内的逐帧分析
/// - Model:        外部检测器 / 跟踪器 / 分类器接口
/// - ByteTracker:  默认跟踪器
/// - History:      每个ID的位置历史
/// - Motion:       速度 / 方向估计
/// - Orchestrator: 单帧编排
pub mod bytetrack;
pub mod history;
pub mod model;
pub mod motion;
pub mod orchestrator;
pub mod types;

pub use bytetrack::{ByteTrackConfig, ByteTracker};
pub use history::{TrackHistory, TrackHistoryEntry};
pub use model::{Classifier, ObjectDetector, Tracker};
pub use motion::{direction_label, SpeedEstimate, TrackSample, DIRECTION_LABELS};
pub use orchestrator::DetectionOrchestrator;
pub use types::{
    BBox, Detection, DetectionResult, Frame, FrameInfo, Prediction, TrackId, TrackedDetection,
    TrackedVehicle,
};
