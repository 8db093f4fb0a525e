//! 集成测试公共替身: 脚本化连接 / 移动目标检测器 / 按序号分配ID的跟踪器
#![allow(dead_code)]

use image::RgbImage;
use rtsp_vehicle_rs::detection::{BBox, Detection, TrackId, TrackedDetection};
use rtsp_vehicle_rs::input::{Connector, StreamConnection, StreamProperties};
use rtsp_vehicle_rs::{Frame, ModelError, PipelineHandle, StreamConfig, StreamError, Tracker};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const FRAME_W: u32 = 320;
pub const FRAME_H: u32 = 240;

/// 一次连接尝试的剧本
#[derive(Debug, Clone, Copy)]
pub enum Session {
    /// 连接被拒绝
    Refused,
    /// 连接成功, 按固定间隔产出若干帧后断开
    Frames { count: usize, interval: Duration },
}

/// 按剧本依次响应连接尝试; 剧本用完后一律拒绝
#[derive(Clone)]
pub struct ScriptedConnector {
    sessions: Arc<Mutex<VecDeque<Session>>>,
    opens: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(sessions: impl IntoIterator<Item = Session>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions.into_iter().collect())),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 连接尝试次数 (克隆之间共享)
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// 转换为可交给流水线的连接器闭包
    pub fn connector(&self) -> impl Connector + 'static {
        let this = self.clone();
        move |config: &StreamConfig| this.open(config)
    }

    fn open(&self, config: &StreamConfig) -> Result<Box<dyn StreamConnection>, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(Session::Frames { count, interval }) => Ok(Box::new(PacedConnection {
                remaining: count,
                interval,
            })),
            _ => Err(StreamError::Open {
                endpoint: config.endpoint.clone(),
                reason: "connection refused".into(),
            }),
        }
    }
}

/// 按固定间隔产出帧, 用完后报告断线
pub struct PacedConnection {
    remaining: usize,
    interval: Duration,
}

impl StreamConnection for PacedConnection {
    fn read_frame(&mut self, _timeout: Duration) -> Result<RgbImage, StreamError> {
        if self.remaining == 0 {
            return Err(StreamError::Disconnected("peer closed".into()));
        }
        self.remaining -= 1;
        thread::sleep(self.interval);
        Ok(RgbImage::new(FRAME_W, FRAME_H))
    }

    fn properties(&self) -> Option<StreamProperties> {
        Some(StreamProperties {
            width: FRAME_W,
            height: FRAME_H,
            fps: 1.0 / self.interval.as_secs_f64().max(1e-3),
            is_live: true,
        })
    }

    fn is_healthy(&self) -> bool {
        self.remaining > 0
    }

    fn close(&mut self) {
        self.remaining = 0;
    }
}

/// 单个车辆每帧向右移动 `step` 像素
pub fn moving_car(
    step: f32,
) -> impl FnMut(&Frame, f32) -> Result<Vec<Detection>, ModelError> + Send + 'static {
    move |frame: &Frame, _threshold: f32| {
        let x = 100.0 + step * frame.sequence as f32;
        Ok(vec![Detection::new(
            BBox::new(x, 100.0, 40.0, 30.0),
            "car",
            0.9,
        )])
    }
}

/// 按检测顺序分配ID (第i个检测 → ID i+1)
pub struct IndexTracker;

impl Tracker for IndexTracker {
    fn update(&mut self, detections: Vec<Detection>) -> Result<Vec<TrackedDetection>, ModelError> {
        Ok(detections
            .into_iter()
            .enumerate()
            .map(|(i, detection)| TrackedDetection {
                id: TrackId(i as u64 + 1),
                detection,
            })
            .collect())
    }
}

/// 快速重试的流配置
pub fn stream_config(max_retries: u32) -> StreamConfig {
    StreamConfig {
        max_retries,
        retry_delay: Duration::from_millis(10),
        read_timeout: Duration::from_millis(200),
        healthy_reads_before_reset: u32::MAX,
        ..StreamConfig::new("rtsp://tester:pw@127.0.0.1:8554/live")
    }
}

/// 等待流水线两个线程都结束
pub fn wait_finished(handle: &PipelineHandle, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while handle.is_running() {
        assert!(Instant::now() < deadline, "pipeline did not finish in {timeout:?}");
        thread::sleep(Duration::from_millis(10));
    }
}
