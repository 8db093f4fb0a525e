/// 结果分发: 回调 / 订阅通道 / 持久化
/// Delivers each result while isolating consumer failures from the pipeline
use super::sink::ResultSink;
use super::stats::{bump, PipelineStats};
use crate::detection::DetectionResult;
use crate::error::DispatchError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// 结果回调 (每帧一次, 在处理线程内同步调用)
pub type ResultCallback = Box<dyn FnMut(&DetectionResult) -> anyhow::Result<()> + Send>;

/// 单次分发的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// 成功送达的消费者数量
    pub delivered: usize,
    pub callback_failed: bool,
    pub sink_failed: bool,
    /// 订阅通道已满, 结果被丢弃
    pub dropped: bool,
}

pub struct ResultDispatcher {
    callback: Option<ResultCallback>,
    sink: Option<Box<dyn ResultSink>>,
    subscriber: Option<Sender<Arc<DetectionResult>>>,
    stats: Arc<PipelineStats>,
}

impl ResultDispatcher {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self {
            callback: None,
            sink: None,
            subscriber: None,
            stats,
        }
    }

    /// 注册回调 (每个流水线最多一个)
    pub fn set_callback(&mut self, callback: ResultCallback) -> Result<(), DispatchError> {
        if self.callback.is_some() {
            return Err(DispatchError::CallbackAlreadyRegistered);
        }
        self.callback = Some(callback);
        Ok(())
    }

    pub fn set_sink(&mut self, sink: Box<dyn ResultSink>) {
        self.sink = Some(sink);
    }

    /// 订阅结果通道 (每个流水线最多一个订阅者); 消费者跟不上时丢弃新结果
    pub fn subscribe(
        &mut self,
        capacity: usize,
    ) -> Result<Receiver<Arc<DetectionResult>>, DispatchError> {
        if self.subscriber.is_some() {
            return Err(DispatchError::SubscriberAlreadyRegistered);
        }
        let (tx, rx) = bounded(capacity.max(1));
        self.subscriber = Some(tx);
        Ok(rx)
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_some()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn dispatch(&mut self, result: DetectionResult) -> DispatchReport {
        let mut report = DispatchReport::default();
        let seq = result.frame.sequence;

        if let Some(callback) = self.callback.as_mut() {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&result))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.callback_failed = true;
                    warn!(seq, err = %format!("{err:#}"), "⚠️ result callback failed");
                }
                Err(_) => {
                    report.callback_failed = true;
                    error!(seq, "❌ result callback panicked");
                }
            }
            if report.callback_failed {
                bump(&self.stats.callback_failures);
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            match sink.persist(&result) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.sink_failed = true;
                    bump(&self.stats.sink_failures);
                    warn!(seq, err = %format!("{err:#}"), "⚠️ result sink failed");
                }
            }
        }

        if let Some(tx) = self.subscriber.as_ref() {
            match tx.try_send(Arc::new(result)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped = true;
                    bump(&self.stats.results_dropped);
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("result subscriber disconnected");
                    self.subscriber = None;
                }
            }
        }

        report
    }

    /// 刷新持久化 (流水线退出时调用)
    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                bump(&self.stats.sink_failures);
                warn!(err = %format!("{err:#}"), "⚠️ result sink flush failed");
            }
        }
    }
}
