//! 外部模型接口 (检测器 / 跟踪器 / 分类器)
//! Contracts for the external detector, tracker and classifiers

use super::types::{Detection, Frame, Prediction, TrackedDetection};
use crate::error::ModelError;
use image::RgbImage;

/// 目标检测器
///
/// 输入一帧图像和置信度阈值, 返回有序检测列表。相同输入必须得到相同输出。
pub trait ObjectDetector: Send {
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, ModelError>;
}

/// 多目标跟踪器
///
/// 输入当前帧检测, 返回带稳定ID的检测。ID连续性完全由跟踪器负责,
/// 目标消失后重新出现时允许分配新ID。
pub trait Tracker: Send {
    fn update(&mut self, detections: Vec<Detection>) -> Result<Vec<TrackedDetection>, ModelError>;
}

/// 外观分类器 (颜色 / 品牌车型), 可选
///
/// 输入单个检测框的裁剪图, 返回按概率排序的标签列表。
pub trait Classifier: Send {
    fn classify(&mut self, crop: &RgbImage) -> Result<Vec<Prediction>, ModelError>;
}

impl<F> ObjectDetector for F
where
    F: FnMut(&Frame, f32) -> Result<Vec<Detection>, ModelError> + Send,
{
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, ModelError> {
        self(frame, confidence_threshold)
    }
}

impl<F> Classifier for F
where
    F: FnMut(&RgbImage) -> Result<Vec<Prediction>, ModelError> + Send,
{
    fn classify(&mut self, crop: &RgbImage) -> Result<Vec<Prediction>, ModelError> {
        self(crop)
    }
}
