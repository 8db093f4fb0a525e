/// 流水线组装与线程管理
/// 采集线程 → [帧通道] → 处理线程 (检测编排 + 结果分发)
use super::dispatcher::{ResultCallback, ResultDispatcher};
use super::sink::ResultSink;
use super::stats::{bump, PipelineStats, RateMeter, StatsSnapshot};
use super::worker::{Inference, InferenceWorker, Stage};
use crate::config::PipelineConfig;
use crate::detection::{
    ByteTracker, Classifier, DetectionOrchestrator, DetectionResult, ObjectDetector, Tracker,
};
use crate::error::{DispatchError, ModelError, PipelineError, StreamError};
use crate::input::{
    frame_channel, ConnectionManager, ConnectionMonitor, ConnectionState, Connector,
    FfmpegConnector, FrameAcquisitionLoop, FrameReceiver, FrameRecv,
};
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 处理线程等待新帧的最长时间 (两次检查停止信号之间)
const RECV_POLL: Duration = Duration::from_millis(50);

// ========== 构建 ==========

pub struct PipelineBuilder {
    config: PipelineConfig,
    connector: Option<Box<dyn Connector>>,
    detector: Option<Box<dyn ObjectDetector>>,
    tracker: Option<Box<dyn Tracker>>,
    color_classifier: Option<Box<dyn Classifier>>,
    model_classifier: Option<Box<dyn Classifier>>,
    callback: Option<ResultCallback>,
    sink: Option<Box<dyn ResultSink>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            connector: None,
            detector: None,
            tracker: None,
            color_classifier: None,
            model_classifier: None,
            callback: None,
            sink: None,
        }
    }

    /// 拉流方式 (默认 ffmpeg 子进程)
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    pub fn detector(mut self, detector: impl ObjectDetector + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    /// 跟踪器 (默认 ByteTracker)
    pub fn tracker(mut self, tracker: impl Tracker + 'static) -> Self {
        self.tracker = Some(Box::new(tracker));
        self
    }

    pub fn color_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.color_classifier = Some(Box::new(classifier));
        self
    }

    pub fn model_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.model_classifier = Some(Box::new(classifier));
        self
    }

    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&DetectionResult) -> anyhow::Result<()> + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn sink(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        let detector = self
            .detector
            .ok_or(PipelineError::MissingComponent("detector"))?;
        let tracker = self
            .tracker
            .unwrap_or_else(|| Box::new(ByteTracker::new(self.config.tracker.clone())));
        let connector = self
            .connector
            .unwrap_or_else(|| Box::new(FfmpegConnector::new()));

        let orchestrator = DetectionOrchestrator::from_config(&self.config, detector, tracker)
            .with_color_classifier(self.color_classifier)
            .with_model_classifier(self.model_classifier);

        let stats = Arc::new(PipelineStats::new());
        let mut dispatcher = ResultDispatcher::new(Arc::clone(&stats));
        if let Some(callback) = self.callback {
            dispatcher.set_callback(callback)?;
        }
        if let Some(sink) = self.sink {
            dispatcher.set_sink(sink);
        }

        Ok(Pipeline {
            config: self.config,
            connector,
            orchestrator,
            dispatcher,
            stats,
        })
    }
}

// ========== 流水线 ==========

/// 已组装但尚未启动的流水线
pub struct Pipeline {
    config: PipelineConfig,
    connector: Box<dyn Connector>,
    orchestrator: DetectionOrchestrator,
    dispatcher: ResultDispatcher,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 注册结果回调 (每个流水线最多一个)
    pub fn set_callback<F>(&mut self, callback: F) -> Result<(), DispatchError>
    where
        F: FnMut(&DetectionResult) -> anyhow::Result<()> + Send + 'static,
    {
        self.dispatcher.set_callback(Box::new(callback))
    }

    /// 结果订阅通道 (显式消费者)
    pub fn subscribe(&mut self) -> Result<Receiver<Arc<DetectionResult>>, DispatchError> {
        self.dispatcher
            .subscribe(self.config.result_channel_capacity)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// 启动采集线程和处理线程
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let Pipeline {
            config,
            connector,
            orchestrator,
            dispatcher,
            stats,
        } = self;

        info!(
            endpoint = %crate::input::ffmpeg::redact(&config.stream.endpoint),
            max_fps = ?config.max_fps,
            color = orchestrator.has_color_classifier(),
            model = orchestrator.has_model_classifier(),
            "🚀 pipeline starting"
        );

        let stop = Arc::new(AtomicBool::new(false));
        let stage = match config.model_timeout {
            Some(timeout) => Stage::Worker(InferenceWorker::spawn(orchestrator, timeout)?),
            None => Stage::Inline(orchestrator),
        };

        let (sender, receiver) = frame_channel(config.frame_channel_capacity);
        let manager = ConnectionManager::new(config.stream.clone(), connector);
        let monitor = manager.monitor();

        let processing = ProcessingLoop {
            receiver,
            stage,
            dispatcher,
            stop: Arc::clone(&stop),
            stats: Arc::clone(&stats),
        };
        let processing = thread::Builder::new()
            .name("processing".into())
            .spawn(move || processing.run())
            .map_err(|source| PipelineError::Spawn {
                name: "processing",
                source,
            })?;

        let acquisition = FrameAcquisitionLoop::new(
            manager,
            sender,
            config.max_fps,
            Arc::clone(&stop),
            Arc::clone(&stats),
        );
        let acquisition = match thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || acquisition.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                // 帧通道发送端随闭包一起释放, 处理线程会自行退出
                stop.store(true, Ordering::Relaxed);
                let _ = processing.join();
                return Err(PipelineError::Spawn {
                    name: "acquisition",
                    source,
                });
            }
        };

        Ok(PipelineHandle {
            stop,
            monitor,
            stats,
            acquisition: Some(acquisition),
            processing: Some(processing),
            started: Instant::now(),
        })
    }
}

// ========== 处理线程 ==========

struct ProcessingLoop {
    receiver: FrameReceiver,
    stage: Stage,
    dispatcher: ResultDispatcher,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
}

impl ProcessingLoop {
    fn run(mut self) -> Result<(), PipelineError> {
        info!("✅ processing thread started");
        let mut meter = RateMeter::new();

        let outcome = loop {
            if self.stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            let frame = match self.receiver.recv_timeout(RECV_POLL) {
                FrameRecv::Frame(frame) => frame,
                FrameRecv::Empty => continue,
                FrameRecv::Closed => break Ok(()),
            };
            let seq = frame.sequence;

            match self.stage.run(frame) {
                Inference::Done(Ok(result)) => {
                    bump(&self.stats.frames_processed);
                    self.stats.add_processing_time(result.processing_time);
                    let ms = result.processing_time.as_secs_f64() * 1000.0;
                    let vehicles = result.count();
                    self.dispatcher.dispatch(result);

                    if let Some(fps) = meter.tick() {
                        self.stats.set_processing_fps(fps);
                        info!(
                            fps = format_args!("{fps:.1}"),
                            ms = format_args!("{ms:.1}"),
                            vehicles,
                            "📊 processing"
                        );
                    }
                }
                Inference::Done(Err(ModelError::WorkerGone)) => {
                    error!(seq, "❌ inference worker is gone, stopping pipeline");
                    break Err(PipelineError::WorkerPanicked("inference"));
                }
                Inference::Done(Err(err)) => {
                    bump(&self.stats.frames_failed);
                    warn!(seq, %err, "⚠️ frame skipped");
                }
                Inference::TimedOut => {
                    bump(&self.stats.frames_timed_out);
                    warn!(seq, "⏱️ model timed out, frame skipped");
                }
                Inference::Busy => {
                    bump(&self.stats.frames_busy);
                    debug!(seq, "model busy, frame skipped");
                }
            }
        };

        if outcome.is_err() {
            // 采集线程也随之停止
            self.stop.store(true, Ordering::Relaxed);
        }
        self.dispatcher.flush();
        info!("✅ processing thread exited");
        outcome
    }
}

// ========== 运行句柄 ==========

/// 运行结束时的汇总
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub elapsed_secs: f64,
    pub stats: StatsSnapshot,
}

/// 运行中的流水线
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    monitor: Arc<ConnectionMonitor>,
    stats: Arc<PipelineStats>,
    acquisition: Option<JoinHandle<Result<(), StreamError>>>,
    processing: Option<JoinHandle<Result<(), PipelineError>>>,
    started: Instant,
}

impl PipelineHandle {
    /// 请求停止 (协作式, 各线程在下一个检查点退出)
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        [
            self.acquisition.as_ref().map(|h| h.is_finished()),
            self.processing.as_ref().map(|h| h.is_finished()),
        ]
        .iter()
        .any(|finished| *finished == Some(false))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.monitor.state(),
            self.monitor.attempts(),
            self.monitor.reconnects(),
        )
    }

    /// 等待两个线程结束 (流失败、停止信号或处理线程出错)
    pub fn join(mut self) -> Result<PipelineSummary, PipelineError> {
        // 采集线程退出后帧通道关闭, 处理线程处理完剩余帧后退出
        let acquisition = self.acquisition.take().map(JoinHandle::join);
        let processing = self.processing.take().map(JoinHandle::join);

        let summary = PipelineSummary {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            stats: self.stats(),
        };
        info!(
            secs = format_args!("{:.1}", summary.elapsed_secs),
            read = summary.stats.frames_read,
            processed = summary.stats.frames_processed,
            skipped = summary.stats.frames_skipped,
            replaced = summary.stats.frames_replaced,
            failed = summary.stats.frames_failed,
            timed_out = summary.stats.frames_timed_out,
            "🏁 pipeline finished"
        );

        match processing {
            Some(Err(_)) => return Err(PipelineError::WorkerPanicked("processing")),
            Some(Ok(Err(err))) => return Err(err),
            _ => {}
        }
        match acquisition {
            Some(Err(_)) => Err(PipelineError::WorkerPanicked("acquisition")),
            Some(Ok(Err(err))) => Err(PipelineError::Stream(err)),
            _ => Ok(summary),
        }
    }

    /// 停止并等待结束
    pub fn shutdown(self) -> Result<PipelineSummary, PipelineError> {
        self.stop();
        self.join()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
