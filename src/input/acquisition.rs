/// 采集线程: 连接管理器 → 帧率限制 → 定长帧通道
/// Acquisition loop, never blocks on downstream processing
use super::frame_slot::{FrameSender, PushOutcome};
use super::manager::{ConnectionManager, ConnectionState};
use crate::detection::Frame;
use crate::error::StreamError;
use crate::pipeline::stats::{bump, PipelineStats, RateMeter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 等待重连时的最长单次休眠 (保证及时响应停止信号)
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct FrameAcquisitionLoop {
    manager: ConnectionManager,
    sender: FrameSender,
    /// 相邻两帧被接受的最小间隔
    min_interval: Option<Duration>,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    started: Instant,
    sequence: u64,
    last_accepted: Option<Instant>,
}

impl FrameAcquisitionLoop {
    pub fn new(
        manager: ConnectionManager,
        sender: FrameSender,
        max_fps: Option<f64>,
        stop: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            manager,
            sender,
            min_interval: max_fps
                .filter(|fps| *fps > 0.0 && fps.is_finite())
                .map(|fps| Duration::from_secs_f64(1.0 / fps)),
            stop,
            stats,
            started: Instant::now(),
            sequence: 0,
            last_accepted: None,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn pause(&self, wait: Duration) {
        let wait = wait.min(POLL_INTERVAL);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }

    /// 帧率上限: 距上一次接受的帧不足一个间隔则丢弃
    fn admit(&mut self, now: Instant) -> bool {
        if let (Some(min), Some(last)) = (self.min_interval, self.last_accepted) {
            if now.duration_since(last) < min {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }

    /// 运行直到停止信号或连接进入 Failed; 退出时关闭连接并结束帧通道
    pub fn run(mut self) -> Result<(), StreamError> {
        info!(endpoint = %self.manager.config().endpoint, "🎬 acquisition started");
        let mut meter = RateMeter::new();

        let outcome = loop {
            if self.stopped() {
                break Ok(());
            }

            // 首次连接 (或首次连接的重试)
            if matches!(
                self.manager.state(),
                ConnectionState::Disconnected | ConnectionState::Connecting
            ) {
                match self.manager.poll_connect() {
                    Ok(()) => continue,
                    Err(err) if err.is_terminal() => break Err(err),
                    Err(_) => {
                        self.pause(self.manager.retry_wait());
                        continue;
                    }
                }
            }

            match self.manager.read_frame() {
                Ok(pixels) => {
                    bump(&self.stats.frames_read);
                    let now = Instant::now();
                    if !self.admit(now) {
                        bump(&self.stats.frames_skipped);
                        continue;
                    }

                    let frame = Frame::new(self.sequence, now - self.started, pixels);
                    self.sequence += 1;
                    match self.sender.push(frame) {
                        PushOutcome::Queued => {}
                        PushOutcome::Replaced => bump(&self.stats.frames_replaced),
                        PushOutcome::Closed => break Ok(()),
                    }
                    bump(&self.stats.frames_accepted);

                    if let Some(fps) = meter.tick() {
                        self.stats.set_acquisition_fps(fps);
                        info!(
                            fps = format_args!("{fps:.1}"),
                            accepted = self.sequence,
                            skipped = self.stats.frames_skipped(),
                            "📺 acquisition"
                        );
                    }
                }
                Err(err) if err.is_terminal() => break Err(err),
                Err(StreamError::Reconnecting { retry_in }) => self.pause(retry_in),
                Err(err) => {
                    bump(&self.stats.read_errors);
                    debug!(%err, "read failed");
                    self.pause(self.manager.retry_wait());
                }
            }
        };

        // Failed 状态保留给监控方, 连接已在进入 Failed 时释放
        if outcome.is_ok() {
            self.manager.close();
        }
        match &outcome {
            Ok(()) => info!(frames = self.sequence, "✅ acquisition stopped"),
            Err(err) => warn!(frames = self.sequence, %err, "❌ acquisition terminated"),
        }
        // self.sender 随 self 一起释放, 处理端收到流结束
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::input::connection::{StreamConnection, StreamProperties};
    use crate::input::frame_slot::{frame_channel, FrameRecv};
    use image::RgbImage;

    /// 按固定帧率产出帧的源
    struct PacedConnection {
        interval: Duration,
        remaining: usize,
    }

    impl StreamConnection for PacedConnection {
        fn read_frame(&mut self, _timeout: Duration) -> Result<RgbImage, StreamError> {
            if self.remaining == 0 {
                return Err(StreamError::EndOfStream);
            }
            self.remaining -= 1;
            thread::sleep(self.interval);
            Ok(RgbImage::new(4, 4))
        }

        fn properties(&self) -> Option<StreamProperties> {
            None
        }

        fn is_healthy(&self) -> bool {
            self.remaining > 0
        }

        fn close(&mut self) {}
    }

    fn manager(frames: usize, interval: Duration, max_retries: u32) -> ConnectionManager {
        let config = StreamConfig {
            max_retries,
            retry_delay: Duration::from_millis(1),
            healthy_reads_before_reset: u32::MAX,
            ..StreamConfig::new("rtsp://paced")
        };
        let connector = move |_: &StreamConfig| -> Result<Box<dyn StreamConnection>, StreamError> {
            Ok(Box::new(PacedConnection {
                interval,
                remaining: frames,
            }))
        };
        ConnectionManager::new(config, Box::new(connector))
    }

    #[test]
    fn test_fps_cap_skips_instead_of_queueing() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = frame_channel(64);
        // 30fps 源, 1秒
        let acquisition = FrameAcquisitionLoop::new(
            manager(30, Duration::from_millis(33), 1),
            tx,
            Some(10.0),
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&stats),
        );
        let err = acquisition.run().unwrap_err();
        assert!(err.is_terminal());

        let mut forwarded = 0;
        while let FrameRecv::Frame(_) = rx.try_recv() {
            forwarded += 1;
        }
        let snap = stats.snapshot(ConnectionState::Failed, 0, 0);
        assert_eq!(snap.frames_read, 30);
        assert!(forwarded <= 11, "forwarded {forwarded}");
        assert!(forwarded >= 5, "forwarded {forwarded}");
        assert_eq!(snap.frames_skipped, 30 - forwarded);
        assert!(matches!(rx.try_recv(), FrameRecv::Closed));
    }

    #[test]
    fn test_stop_signal_ends_loop() {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = frame_channel(1);
        let acquisition = FrameAcquisitionLoop::new(
            manager(usize::MAX, Duration::from_millis(5), 3),
            tx,
            None,
            Arc::clone(&stop),
            Arc::new(PipelineStats::new()),
        );
        let handle = thread::spawn(move || acquisition.run());
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        assert!(handle.join().unwrap().is_ok());

        // 单帧通道: 只保留最新一帧
        assert!(matches!(rx.try_recv(), FrameRecv::Frame(_)));
        assert!(matches!(rx.try_recv(), FrameRecv::Closed));
    }
}
