// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// ByteTrack 算法实现
/// ByteTrack: Simple and effective multi-object tracking
///
/// 核心思想:
/// 1. 高低分检测框分开处理
/// 2. 高分框优先匹配 (IOU)
/// 3. 低分框救援丢失的轨迹
/// 4. 纯运动模型,无需外观特征
use super::model::Tracker;
use super::types::{BBox, Detection, TrackId, TrackedDetection};
use crate::error::ModelError;
use serde::{Deserialize, Serialize};

/// ByteTrack 参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ByteTrackConfig {
    /// 最大允许丢失帧数
    pub max_lost_frames: u32,
    /// 高分检测阈值
    pub high_score_threshold: f32,
    /// 低分检测阈值 (用于救援)
    pub low_score_threshold: f32,
    /// 高分匹配 IOU 阈值
    pub high_iou_threshold: f32,
    /// 低分匹配 IOU 阈值 (更严格)
    pub low_iou_threshold: f32,
}

impl Default for ByteTrackConfig {
    fn default() -> Self {
        Self {
            max_lost_frames: 30, // 30帧 ≈ 1秒@30fps
            high_score_threshold: 0.5,
            low_score_threshold: 0.1,
            high_iou_threshold: 0.3,
            low_iou_threshold: 0.5,
        }
    }
}

/// 简化卡尔曼滤波器 (用于单个边界框)
#[derive(Clone, Debug)]
struct KalmanBoxFilter {
    // 状态估计: [cx, cy, w, h, vx, vy, vw, vh]
    state: [f32; 8],
    // 估计误差协方差 (简化为对角阵)
    p: [f32; 8],
    // 过程噪声
    q: f32,
    // 观测噪声
    r: f32,
}

impl KalmanBoxFilter {
    fn new(bbox: &BBox) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            state: [cx, cy, bbox.width, bbox.height, 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q: 0.1,
            r: 1.0,
        }
    }

    fn predict(&mut self) {
        // 匀速运动模型
        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }
        for p in &mut self.p {
            *p += self.q;
        }
    }

    fn update(&mut self, bbox: &BBox) {
        let (cx, cy) = bbox.center();
        let y = [
            cx - self.state[0],
            cy - self.state[1],
            bbox.width - self.state[2],
            bbox.height - self.state[3],
        ];

        for i in 0..4 {
            let k = self.p[i] / (self.p[i] + self.r);
            // 速度增益降低
            let kv = self.p[i + 4] / (self.p[i + 4] + self.r * 5.0);
            self.state[i] += k * y[i];
            self.state[i + 4] += kv * y[i];
            self.p[i] *= 1.0 - k;
            self.p[i + 4] *= 1.0 - kv;
        }
    }

    /// 当前状态对应的框; `predict` 之后即为本帧的预测框 (用于匹配)
    fn predicted_bbox(&self) -> BBox {
        let (cx, cy) = (self.state[0], self.state[1]);
        let w = self.state[2].max(1.0);
        let h = self.state[3].max(1.0);
        BBox::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }
}

/// 单条轨迹
#[derive(Clone, Debug)]
struct Track {
    id: TrackId,
    kalman: KalmanBoxFilter,
    /// 连续丢失帧数
    frames_lost: u32,
    /// 总共被跟踪的帧数
    hits: u32,
}

impl Track {
    fn new(id: TrackId, bbox: &BBox) -> Self {
        Self {
            id,
            kalman: KalmanBoxFilter::new(bbox),
            frames_lost: 0,
            hits: 1,
        }
    }

    fn update(&mut self, bbox: &BBox) {
        self.kalman.update(bbox);
        self.frames_lost = 0;
        self.hits += 1;
    }
}

/// ByteTrack 追踪器
///
/// 每帧输出的是本帧匹配上 (或新建) 轨迹的原始检测, 附带轨迹ID;
/// 丢失中的轨迹只参与后续匹配, 不出现在输出中。
pub struct ByteTracker {
    config: ByteTrackConfig,
    tracks: Vec<Track>,
    /// 下一个分配的ID
    next_id: u64,
}

impl ByteTracker {
    pub fn new(config: ByteTrackConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// 更新跟踪 (ByteTrack 三步匹配), 返回 (检测下标, 轨迹ID)
    fn associate(&mut self, detections: &[Detection]) -> Vec<(usize, TrackId)> {
        // 1. 所有轨迹先预测
        for track in &mut self.tracks {
            track.kalman.predict();
        }

        // 2. 分离高低分检测框
        let mut high = Vec::new();
        let mut low = Vec::new();
        for (idx, det) in detections.iter().enumerate() {
            if det.confidence >= self.config.high_score_threshold {
                high.push(idx);
            } else if det.confidence >= self.config.low_score_threshold {
                low.push(idx);
            }
        }

        let mut assigned: Vec<(usize, TrackId)> = Vec::new();
        let mut matched_track = vec![false; self.tracks.len()];

        // 3. 第一轮匹配: 高分检测 + 所有轨迹
        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        let high_iou = self.config.high_iou_threshold;
        let first = self.match_greedy(detections, &high, &all_tracks, high_iou);
        for &(det_idx, track_idx) in &first {
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx].bbox);
            assigned.push((det_idx, self.tracks[track_idx].id));
        }

        // 4. 第二轮匹配: 低分检测 + 未匹配的轨迹 (救援)
        let unmatched: Vec<usize> = all_tracks
            .iter()
            .copied()
            .filter(|&idx| !matched_track[idx])
            .collect();
        let second = self.match_greedy(detections, &low, &unmatched, self.config.low_iou_threshold);
        for &(det_idx, track_idx) in &second {
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx].bbox);
            assigned.push((det_idx, self.tracks[track_idx].id));
        }

        // 5. 未匹配的轨迹 → 标记丢失
        for (track, matched) in self.tracks.iter_mut().zip(&matched_track) {
            if !matched {
                track.frames_lost += 1;
            }
        }

        // 6. 未匹配的高分检测 → 新建轨迹
        for &det_idx in &high {
            if assigned.iter().any(|&(d, _)| d == det_idx) {
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id += 1;
            self.tracks.push(Track::new(id, &detections[det_idx].bbox));
            assigned.push((det_idx, id));
        }

        // 7. 删除丢失太久的轨迹
        let max_lost = self.config.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        assigned.sort_by_key(|&(det_idx, _)| det_idx);
        assigned
    }

    /// IOU 贪心匹配: 按代价 (1 - IOU) 排序
    fn match_greedy(
        &self,
        detections: &[Detection],
        det_indices: &[usize],
        track_indices: &[usize],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        if det_indices.is_empty() || track_indices.is_empty() {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for &det_idx in det_indices {
            for &track_idx in track_indices {
                let predicted = self.tracks[track_idx].kalman.predicted_bbox();
                let iou = detections[det_idx].bbox.iou(&predicted);
                if iou >= iou_threshold {
                    candidates.push((1.0 - iou, det_idx, track_idx));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_det = Vec::new();
        let mut used_track = Vec::new();
        let mut assignments = Vec::new();
        for (_, det_idx, track_idx) in candidates {
            if !used_det.contains(&det_idx) && !used_track.contains(&track_idx) {
                used_det.push(det_idx);
                used_track.push(track_idx);
                assignments.push((det_idx, track_idx));
            }
        }
        assignments
    }
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new(ByteTrackConfig::default())
    }
}

impl Tracker for ByteTracker {
    fn update(&mut self, detections: Vec<Detection>) -> Result<Vec<TrackedDetection>, ModelError> {
        let assigned = self.associate(&detections);
        let mut slots: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();
        Ok(assigned
            .into_iter()
            .filter_map(|(det_idx, id)| {
                slots[det_idx]
                    .take()
                    .map(|detection| TrackedDetection { id, detection })
            })
            .collect())
    }
}
