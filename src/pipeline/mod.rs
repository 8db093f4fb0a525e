/// 视频处理流水线 (Video Processing Pipeline)
///
/// 两线程架构,通过定长帧通道通信:
/// - Acquisition: 拉流采集 (独立线程, 永不阻塞)
/// - Processing:  检测 + 跟踪 + 测速 + 结果分发 (独立线程)
/// - Inference:   可选的带超时推理线程
pub mod dispatcher;
pub mod runner;
pub mod sink;
pub mod stats;
pub mod worker;

pub use dispatcher::{DispatchReport, ResultCallback, ResultDispatcher};
pub use runner::{Pipeline, PipelineBuilder, PipelineHandle, PipelineSummary};
pub use sink::{JsonLinesSink, ResultSink};
pub use stats::{PipelineStats, RateMeter, StatsSnapshot};
pub use worker::{Inference, InferenceWorker, Stage};
