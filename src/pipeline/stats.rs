//! 流水线统计 (每个流水线实例一份, 不使用全局计数器)
//! Per-pipeline health counters

use crate::input::ConnectionState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 计数器
#[derive(Debug, Default)]
pub struct PipelineStats {
    // 采集侧
    pub(crate) frames_read: AtomicU64,
    pub(crate) frames_accepted: AtomicU64,
    pub(crate) frames_skipped: AtomicU64,
    pub(crate) frames_replaced: AtomicU64,
    pub(crate) read_errors: AtomicU64,
    // 处理侧
    pub(crate) frames_processed: AtomicU64,
    pub(crate) frames_failed: AtomicU64,
    pub(crate) frames_timed_out: AtomicU64,
    pub(crate) frames_busy: AtomicU64,
    pub(crate) processing_nanos: AtomicU64,
    // 分发侧
    pub(crate) callback_failures: AtomicU64,
    pub(crate) sink_failures: AtomicU64,
    pub(crate) results_dropped: AtomicU64,
    // f64 按位存储
    acquisition_fps: AtomicU64,
    processing_fps: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_acquisition_fps(&self, fps: f64) {
        self.acquisition_fps.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn set_processing_fps(&self, fps: f64) {
        self.processing_fps.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn add_processing_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.processing_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn acquisition_fps(&self) -> f64 {
        f64::from_bits(self.acquisition_fps.load(Ordering::Relaxed))
    }

    pub fn processing_fps(&self) -> f64 {
        f64::from_bits(self.processing_fps.load(Ordering::Relaxed))
    }

    /// 一致性不做保证的快照 (各计数器分别读取)
    pub fn snapshot(
        &self,
        connection: ConnectionState,
        attempts: u32,
        reconnects: u64,
    ) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let processed = load(&self.frames_processed);
        let total_nanos = load(&self.processing_nanos);
        StatsSnapshot {
            connection,
            connection_attempts: attempts,
            reconnects,
            frames_read: load(&self.frames_read),
            frames_accepted: load(&self.frames_accepted),
            frames_skipped: load(&self.frames_skipped),
            frames_replaced: load(&self.frames_replaced),
            read_errors: load(&self.read_errors),
            frames_processed: processed,
            frames_failed: load(&self.frames_failed),
            frames_timed_out: load(&self.frames_timed_out),
            frames_busy: load(&self.frames_busy),
            callback_failures: load(&self.callback_failures),
            sink_failures: load(&self.sink_failures),
            results_dropped: load(&self.results_dropped),
            acquisition_fps: self.acquisition_fps(),
            processing_fps: self.processing_fps(),
            avg_processing_ms: if processed == 0 {
                0.0
            } else {
                total_nanos as f64 / processed as f64 / 1e6
            },
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub connection: ConnectionState,
    pub connection_attempts: u32,
    pub reconnects: u64,
    pub frames_read: u64,
    pub frames_accepted: u64,
    /// 因帧率上限丢弃
    pub frames_skipped: u64,
    /// 因通道已满被新帧替换
    pub frames_replaced: u64,
    pub read_errors: u64,
    pub frames_processed: u64,
    /// 检测器/跟踪器失败而跳过
    pub frames_failed: u64,
    pub frames_timed_out: u64,
    /// 上一帧推理尚未完成而跳过
    pub frames_busy: u64,
    pub callback_failures: u64,
    pub sink_failures: u64,
    pub results_dropped: u64,
    pub acquisition_fps: f64,
    pub processing_fps: f64,
    pub avg_processing_ms: f64,
}

/// 每秒一次的帧率计量
#[derive(Debug)]
pub struct RateMeter {
    count: u32,
    last: Instant,
}

impl RateMeter {
    pub fn new() -> Self {
        Self {
            count: 0,
            last: Instant::now(),
        }
    }

    /// 计一帧; 满一秒时返回这一秒的帧率
    pub fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed < 1.0 {
            return None;
        }
        let fps = self.count as f64 / elapsed;
        self.count = 0;
        self.last = Instant::now();
        Some(fps)
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}
