// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 单帧检测编排: 检测 → 跟踪 → 可选分类 → 轨迹历史/测速 → 组装结果
/// Per-frame transformation, no I/O
use super::history::TrackHistory;
use super::model::{Classifier, ObjectDetector, Tracker};
use super::types::{Detection, DetectionResult, Frame, Prediction, TrackedVehicle};
use crate::config::{HistoryConfig, PipelineConfig};
use crate::error::ModelError;
use image::imageops;
use std::time::Instant;
use tracing::{debug, warn};

pub struct DetectionOrchestrator {
    detector: Box<dyn ObjectDetector>,
    tracker: Box<dyn Tracker>,
    // 分类能力在构造时确定
    color_classifier: Option<Box<dyn Classifier>>,
    model_classifier: Option<Box<dyn Classifier>>,
    history: TrackHistory,
    confidence_threshold: f32,
    // 小写类别名, 空 = 全部
    vehicle_classes: Vec<String>,
}

impl DetectionOrchestrator {
    pub fn new(
        detector: Box<dyn ObjectDetector>,
        tracker: Box<dyn Tracker>,
        history: HistoryConfig,
    ) -> Self {
        Self {
            detector,
            tracker,
            color_classifier: None,
            model_classifier: None,
            history: TrackHistory::new(history),
            confidence_threshold: 0.5,
            vehicle_classes: Vec::new(),
        }
    }

    /// 按流水线配置创建 (阈值 / 类别过滤 / 历史参数)
    pub fn from_config(
        config: &PipelineConfig,
        detector: Box<dyn ObjectDetector>,
        tracker: Box<dyn Tracker>,
    ) -> Self {
        Self::new(detector, tracker, config.history.clone())
            .with_confidence_threshold(config.confidence_threshold)
            .with_vehicle_classes(config.vehicle_classes.iter().cloned())
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_vehicle_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vehicle_classes = classes
            .into_iter()
            .map(|c| c.into().to_lowercase())
            .collect();
        self
    }

    pub fn with_color_classifier(mut self, classifier: Option<Box<dyn Classifier>>) -> Self {
        self.color_classifier = classifier;
        self
    }

    pub fn with_model_classifier(mut self, classifier: Option<Box<dyn Classifier>>) -> Self {
        self.model_classifier = classifier;
        self
    }

    pub fn history(&self) -> &TrackHistory {
        &self.history
    }

    pub fn has_color_classifier(&self) -> bool {
        self.color_classifier.is_some()
    }

    pub fn has_model_classifier(&self) -> bool {
        self.model_classifier.is_some()
    }

    fn is_vehicle(&self, detection: &Detection) -> bool {
        self.vehicle_classes.is_empty()
            || self
                .vehicle_classes
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&detection.label))
    }

    /// 处理一帧; 检测器或跟踪器失败时返回错误, 调用方跳过该帧
    pub fn process(&mut self, frame: &Frame) -> Result<DetectionResult, ModelError> {
        self.process_unless(frame, || false)
    }

    /// 同 [`process`](Self::process), 但在写入轨迹历史前检查 `abandoned`:
    /// 调用方已放弃的帧 (例如推理超时) 返回 [`ModelError::Abandoned`],
    /// 其位置不进入历史。跟踪器状态此时已经前进。
    pub fn process_unless(
        &mut self,
        frame: &Frame,
        abandoned: impl Fn() -> bool,
    ) -> Result<DetectionResult, ModelError> {
        let start = Instant::now();
        let now = frame.captured_at;

        // 1. 清理过期ID (在写入新采样之前, 保证重新出现的ID从头开始)
        self.history.evict_stale(now);

        // 2. 检测 + 阈值/类别过滤
        let threshold = self.confidence_threshold;
        let detections: Vec<Detection> = self
            .detector
            .detect(frame, threshold)?
            .into_iter()
            .filter(|d| d.confidence >= threshold && self.is_vehicle(d))
            .collect();

        // 3. 跟踪 (ID连续性完全交给跟踪器)
        let tracked = self.tracker.update(detections)?;

        // 4. 可选分类
        let mut classified = Vec::with_capacity(tracked.len());
        for item in tracked {
            let color_info = classify(&mut self.color_classifier, frame, &item.detection, "color");
            let model_info = classify(&mut self.model_classifier, frame, &item.detection, "model");
            classified.push((item, color_info, model_info));
        }

        if abandoned() {
            debug!(seq = frame.sequence, "abandoned frame, history untouched");
            return Err(ModelError::Abandoned(frame.sequence));
        }

        // 5. 轨迹历史 + 测速
        let mut vehicles = Vec::with_capacity(classified.len());
        for (item, color_info, model_info) in classified {
            let speed = self
                .history
                .record(item.id, now, item.detection.bbox.center());
            vehicles.push(TrackedVehicle {
                id: item.id,
                detection: item.detection,
                speed,
                color_info,
                model_info,
            });
        }

        let processing_time = start.elapsed();
        debug!(
            seq = frame.sequence,
            vehicles = vehicles.len(),
            tracks = self.history.len(),
            ms = processing_time.as_secs_f64() * 1000.0,
            "frame processed"
        );

        Ok(DetectionResult {
            frame: frame.info(),
            vehicles,
            processing_time,
        })
    }
}

/// 对单个检测框调用分类器; 缺失或失败时返回 None (不影响整帧)
fn classify(
    classifier: &mut Option<Box<dyn Classifier>>,
    frame: &Frame,
    detection: &Detection,
    kind: &'static str,
) -> Option<Vec<Prediction>> {
    let classifier = classifier.as_mut()?;
    let (x, y, w, h) = detection.bbox.clamp_to(frame.width(), frame.height())?;
    let crop = imageops::crop_imm(&frame.pixels, x, y, w, h).to_image();
    match classifier.classify(&crop) {
        Ok(mut predictions) => {
            predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));
            Some(predictions)
        }
        Err(err) => {
            warn!(seq = frame.sequence, kind, %err, "classifier failed, field omitted");
            None
        }
    }
}
