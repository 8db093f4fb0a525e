//! 轨迹历史 (每个ID一个定长环形缓冲)
//! Per-identity bounded history of center positions

use super::motion::{self, SpeedEstimate, TrackSample};
use super::types::TrackId;
use crate::config::HistoryConfig;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// 单个ID的历史记录
#[derive(Debug, Clone)]
pub struct TrackHistoryEntry {
    samples: VecDeque<TrackSample>,
    last_seen: Duration,
}

impl TrackHistoryEntry {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            last_seen: Duration::ZERO,
        }
    }

    pub fn samples(&self) -> &VecDeque<TrackSample> {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last_seen(&self) -> Duration {
        self.last_seen
    }

    /// 追加采样点; 超出容量或时间窗口的旧点被淘汰
    fn push(&mut self, sample: TrackSample, config: &HistoryConfig) -> bool {
        if let Some(last) = self.samples.back() {
            // 时间戳必须严格递增 (同一帧重复上报或乱序的点直接忽略)
            if sample.t <= last.t {
                return false;
            }
        }

        self.samples.push_back(sample);
        self.last_seen = sample.t;

        while self.samples.len() > config.capacity {
            self.samples.pop_front();
        }
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some(front) if sample.t.saturating_sub(front.t) > config.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
        true
    }
}

/// 所有ID的轨迹历史, 只由处理线程写入
#[derive(Debug)]
pub struct TrackHistory {
    config: HistoryConfig,
    entries: HashMap<TrackId, TrackHistoryEntry>,
}

impl TrackHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// 记录一个新位置并返回最新速度估计
    pub fn record(&mut self, id: TrackId, t: Duration, center: (f32, f32)) -> SpeedEstimate {
        let staleness = self.config.staleness_timeout;
        let capacity = self.config.capacity;
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| TrackHistoryEntry::new(capacity));

        // 尚未被清理但已经过期的ID: 重新开始, 不复用旧数据
        if !entry.is_empty() && t.saturating_sub(entry.last_seen) > staleness {
            debug!(track = %id, "stale history restarted");
            entry.samples.clear();
        }

        let sample = TrackSample::new(t, center.0 as f64, center.1 as f64);
        entry.push(sample, &self.config);
        motion::estimate(&entry.samples, &self.config)
    }

    /// 清除超过 staleness_timeout 未出现的ID (唯一的删除路径)
    pub fn evict_stale(&mut self, now: Duration) -> Vec<TrackId> {
        let timeout = self.config.staleness_timeout;
        let mut evicted = Vec::new();
        self.entries.retain(|id, entry| {
            let keep = now.saturating_sub(entry.last_seen) <= timeout;
            if !keep {
                evicted.push(*id);
            }
            keep
        });
        if !evicted.is_empty() {
            evicted.sort();
            debug!(?evicted, remaining = self.entries.len(), "evicted stale tracks");
        }
        evicted
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackHistoryEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn history(capacity: usize) -> TrackHistory {
        TrackHistory::new(HistoryConfig {
            capacity,
            window: Duration::from_secs(60),
            lookback: Duration::from_secs(60),
            staleness_timeout: Duration::from_secs(1),
            ..Default::default()
        })
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut h = history(5);
        let id = TrackId(1);
        for i in 0..50 {
            h.record(id, ms(i * 100), (10.0, 10.0));
            assert!(h.get(id).unwrap().len() <= 5);
        }
        assert_eq!(h.get(id).unwrap().len(), 5);
        assert_eq!(h.get(id).unwrap().samples().front().unwrap().t, ms(4500));
    }

    #[test]
    fn test_time_window_is_bounded() {
        let mut h = TrackHistory::new(HistoryConfig {
            capacity: 100,
            window: Duration::from_millis(500),
            staleness_timeout: Duration::from_secs(10),
            ..Default::default()
        });
        let id = TrackId(2);
        for i in 0..20 {
            h.record(id, ms(i * 100), (i as f32, 0.0));
        }
        // 1400..1900 → 6 个点
        assert_eq!(h.get(id).unwrap().len(), 6);
    }

    #[test]
    fn test_first_sample_is_unknown_second_is_known() {
        let mut h = history(10);
        let first = h.record(TrackId(3), ms(0), (0.0, 0.0));
        assert_eq!(first, SpeedEstimate::unknown());
        let second = h.record(TrackId(3), ms(100), (10.0, 0.0));
        assert!(second.reliability > 0.0);
        assert_eq!(second.direction_label, "Right");
    }

    #[test]
    fn test_duplicate_timestamp_ignored() {
        let mut h = history(10);
        h.record(TrackId(4), ms(100), (0.0, 0.0));
        h.record(TrackId(4), ms(100), (50.0, 0.0));
        h.record(TrackId(4), ms(50), (50.0, 0.0));
        assert_eq!(h.get(TrackId(4)).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_identity_is_evicted() {
        let mut h = history(10);
        h.record(TrackId(1), ms(0), (0.0, 0.0));
        h.record(TrackId(2), ms(0), (0.0, 0.0));
        h.record(TrackId(2), ms(900), (5.0, 0.0));

        assert!(h.evict_stale(ms(1000)).is_empty());
        assert_eq!(h.evict_stale(ms(1500)), vec![TrackId(1)]);
        assert!(!h.contains(TrackId(1)));
        assert!(h.contains(TrackId(2)));
        assert_eq!(h.evict_stale(ms(5000)), vec![TrackId(2)]);
        assert!(h.is_empty());
    }

    #[test]
    fn test_reappearance_starts_fresh_history() {
        let mut h = history(10);
        let id = TrackId(9);
        h.record(id, ms(0), (0.0, 0.0));
        h.record(id, ms(100), (10.0, 0.0));
        h.evict_stale(ms(3000));

        let est = h.record(id, ms(3000), (500.0, 500.0));
        assert_eq!(h.get(id).unwrap().len(), 1);
        assert_eq!(est, SpeedEstimate::unknown());
    }

    #[test]
    fn test_stale_entry_restarts_without_explicit_eviction() {
        let mut h = history(10);
        let id = TrackId(5);
        h.record(id, ms(0), (0.0, 0.0));
        h.record(id, ms(100), (10.0, 0.0));
        let est = h.record(id, ms(5000), (900.0, 0.0));
        assert_eq!(h.get(id).unwrap().len(), 1);
        assert_eq!(est.direction_label, "Unknown");
    }
}
