/// 推理阶段: 处理线程内直接调用, 或在独立推理线程中带超时调用
/// Inference stage with an optional per-frame model timeout
use crate::detection::{DetectionOrchestrator, DetectionResult, Frame};
use crate::error::{ModelError, PipelineError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// 单帧推理结果
#[derive(Debug)]
pub enum Inference {
    Done(Result<DetectionResult, ModelError>),
    /// 上一帧仍在推理 (已超时但未返回), 本帧跳过
    Busy,
    /// 超过 model_timeout 未返回, 本帧跳过
    TimedOut,
}

pub enum Stage {
    Inline(DetectionOrchestrator),
    Worker(InferenceWorker),
}

impl Stage {
    pub fn run(&mut self, frame: Frame) -> Inference {
        match self {
            Stage::Inline(orchestrator) => Inference::Done(orchestrator.process(&frame)),
            Stage::Worker(worker) => worker.submit(frame),
        }
    }
}

type Reply = (u64, Result<DetectionResult, ModelError>);

/// 独立推理线程 (一次只处理一帧)
pub struct InferenceWorker {
    requests: Option<Sender<Frame>>,
    replies: Receiver<Reply>,
    /// 已提交但尚未返回的帧序号
    in_flight: Option<u64>,
    /// 已超时帧的序号 + 1 (0 = 无); 推理线程据此跳过历史写入
    abandoned: Arc<AtomicU64>,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    pub fn spawn(
        mut orchestrator: DetectionOrchestrator,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let (req_tx, req_rx) = bounded::<Frame>(1);
        let (rep_tx, rep_rx) = bounded::<Reply>(1);
        let abandoned = Arc::new(AtomicU64::new(0));
        let abandoned_flag = Arc::clone(&abandoned);

        let handle = thread::Builder::new()
            .name("inference".into())
            .spawn(move || {
                info!("✅ inference thread started");
                for frame in req_rx.iter() {
                    let marker = frame.sequence + 1;
                    let is_abandoned = || abandoned_flag.load(Ordering::Acquire) == marker;
                    let result = orchestrator.process_unless(&frame, is_abandoned);
                    if rep_tx.send((frame.sequence, result)).is_err() {
                        break;
                    }
                }
                info!("✅ inference thread exited");
            })
            .map_err(|source| PipelineError::Spawn {
                name: "inference",
                source,
            })?;

        Ok(Self {
            requests: Some(req_tx),
            replies: rep_rx,
            in_flight: None,
            abandoned,
            timeout,
            handle: Some(handle),
        })
    }

    /// 提交一帧并等待结果 (最多 timeout)
    pub fn submit(&mut self, frame: Frame) -> Inference {
        // 超时的上一帧: 结果晚到则丢弃, 仍未返回则跳过本帧
        if let Some(pending) = self.in_flight {
            match self.replies.try_recv() {
                Ok((seq, _)) => {
                    debug!(seq, pending, "late inference result discarded");
                    self.in_flight = None;
                }
                Err(TryRecvError::Empty) => return Inference::Busy,
                Err(TryRecvError::Disconnected) => {
                    return Inference::Done(Err(ModelError::WorkerGone))
                }
            }
        }

        let Some(requests) = self.requests.as_ref() else {
            return Inference::Done(Err(ModelError::WorkerGone));
        };
        let seq = frame.sequence;
        if requests.send(frame).is_err() {
            return Inference::Done(Err(ModelError::WorkerGone));
        }
        self.in_flight = Some(seq);

        match self.replies.recv_timeout(self.timeout) {
            Ok((_, result)) => {
                self.in_flight = None;
                Inference::Done(result)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.abandoned.store(seq + 1, Ordering::Release);
                Inference::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => Inference::Done(Err(ModelError::WorkerGone)),
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        // 关闭请求通道, 推理线程处理完当前帧后退出
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            // 模型仍卡在某一帧时不等待
            if self.in_flight.is_none() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryConfig;
    use crate::detection::{BBox, Detection, ObjectDetector, TrackId, Tracker, TrackedDetection};
    use image::RgbImage;

    /// 第 n 帧耗时 delays[n]; 一辆车每帧右移 10 像素
    struct SlowDetector {
        delays: Vec<Duration>,
    }

    impl ObjectDetector for SlowDetector {
        fn detect(&mut self, frame: &Frame, _thr: f32) -> Result<Vec<Detection>, ModelError> {
            let delay = self
                .delays
                .get(frame.sequence as usize)
                .copied()
                .unwrap_or_default();
            thread::sleep(delay);
            let x = 100.0 + 10.0 * frame.sequence as f32;
            Ok(vec![Detection::new(BBox::new(x, 50.0, 20.0, 20.0), "car", 0.9)])
        }
    }

    /// 所有检测都归为 ID 1
    struct SingleTracker;

    impl Tracker for SingleTracker {
        fn update(&mut self, d: Vec<Detection>) -> Result<Vec<TrackedDetection>, ModelError> {
            Ok(d.into_iter()
                .map(|detection| TrackedDetection {
                    id: TrackId(1),
                    detection,
                })
                .collect())
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Duration::from_millis(seq * 100), RgbImage::new(4, 4))
    }

    fn slow_worker(delays: Vec<Duration>) -> InferenceWorker {
        let orchestrator = DetectionOrchestrator::new(
            Box::new(SlowDetector { delays }),
            Box::new(SingleTracker),
            HistoryConfig::default(),
        );
        InferenceWorker::spawn(orchestrator, Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn test_slow_model_times_out_and_skips_until_free() {
        let mut worker = slow_worker(vec![
            Duration::ZERO,
            Duration::from_millis(300),
            Duration::ZERO,
            Duration::ZERO,
        ]);

        assert!(matches!(worker.submit(frame(0)), Inference::Done(Ok(_))));
        assert!(matches!(worker.submit(frame(1)), Inference::TimedOut));
        // 第1帧仍在推理
        assert!(matches!(worker.submit(frame(2)), Inference::Busy));

        thread::sleep(Duration::from_millis(350));
        match worker.submit(frame(3)) {
            Inference::Done(Ok(result)) => assert_eq!(result.frame.sequence, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_timed_out_frame_leaves_history_untouched() {
        let mut worker = slow_worker(vec![Duration::ZERO, Duration::from_millis(300)]);

        assert!(matches!(worker.submit(frame(0)), Inference::Done(Ok(_))));
        assert!(matches!(worker.submit(frame(1)), Inference::TimedOut));
        thread::sleep(Duration::from_millis(350));

        let result = match worker.submit(frame(3)) {
            Inference::Done(Ok(result)) => result,
            other => panic!("unexpected {other:?}"),
        };
        // 历史中只有第0帧和第3帧: 共线两点, 采样数因子 1/9
        let speed = &result.vehicle(TrackId(1)).unwrap().speed;
        assert!((speed.reliability - 1.0 / 9.0).abs() < 1e-9, "{}", speed.reliability);
        assert_eq!(speed.direction_label, "Right");
    }
}
