//! 检测系统数据结构定义
//! Data structures for the vehicle detection pipeline

use super::motion::SpeedEstimate;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

// ========== 身份与检测框 ==========

/// 跟踪ID (由外部跟踪器分配, 本系统从不自行生成或复用)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 检测框 (左上角 + 宽高, 像素坐标)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn x2(&self) -> f32 {
        self.x + self.width
    }

    pub fn y2(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// 计算IOU (Intersection over Union)
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// 裁剪到图像范围内, 返回整数区域 (x, y, w, h); 空区域返回 None
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.max(0.0).floor() as u32;
        let y1 = self.y.max(0.0).floor() as u32;
        let x2 = (self.x2().max(0.0).ceil() as u32).min(width);
        let y2 = (self.y2().max(0.0).ceil() as u32).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// 单帧检测结果 (每个目标一条, 仅在一帧内有效)
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
    /// 检测置信度 [0, 1]
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BBox, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
        }
    }
}

/// 跟踪器输出: 带ID的检测
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedDetection {
    pub id: TrackId,
    pub detection: Detection,
}

/// 分类器输出 (颜色 / 车型)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, probability: f32) -> Self {
        Self {
            label: label.into(),
            probability,
        }
    }
}

// ========== 帧 ==========

/// 采集帧 (采集线程 → 处理线程, 处理一次后丢弃)
pub struct Frame {
    /// 单调递增帧序号
    pub sequence: u64,
    /// 相对流开始的采集时间 (单调时钟, 用于测速)
    pub captured_at: Duration,
    /// 墙钟时间 (用于输出)
    pub timestamp: DateTime<Utc>,
    pub pixels: RgbImage,
}

impl Frame {
    pub fn new(sequence: u64, captured_at: Duration, pixels: RgbImage) -> Self {
        Self {
            sequence,
            captured_at,
            timestamp: Utc::now(),
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// 帧引用 (结果中只保留元数据, 不保留像素)
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            sequence: self.sequence,
            captured_at: self.captured_at,
            timestamp: self.timestamp,
            width: self.width(),
            height: self.height(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub sequence: u64,
    pub captured_at: Duration,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

// ========== 结果 ==========

/// 单个车辆的输出 (ID + 检测 + 速度 + 可选分类)
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedVehicle {
    pub id: TrackId,
    pub detection: Detection,
    pub speed: SpeedEstimate,
    pub color_info: Option<Vec<Prediction>>,
    pub model_info: Option<Vec<Prediction>>,
}

/// 单帧处理结果, 交给 ResultDispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub frame: FrameInfo,
    pub vehicles: Vec<TrackedVehicle>,
    pub processing_time: Duration,
}

impl DetectionResult {
    pub fn count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn vehicle(&self, id: TrackId) -> Option<&TrackedVehicle> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// 输出记录格式 (与下游消费方约定的字段名)

#[derive(Serialize)]
struct Coordinates {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

#[derive(Serialize)]
struct VehicleRecord<'a> {
    vehicle_id: TrackId,
    vehicle_type: &'a str,
    detection_confidence: f32,
    speed_info: &'a SpeedEstimate,
    vehicle_coordinates: Coordinates,
    #[serde(skip_serializing_if = "Option::is_none")]
    color_info: Option<&'a [Prediction]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_info: Option<&'a [Prediction]>,
}

impl Serialize for TrackedVehicle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bbox = &self.detection.bbox;
        VehicleRecord {
            vehicle_id: self.id,
            vehicle_type: &self.detection.label,
            detection_confidence: self.detection.confidence,
            speed_info: &self.speed,
            vehicle_coordinates: Coordinates {
                x: bbox.x,
                y: bbox.y,
                width: bbox.width,
                height: bbox.height,
            },
            color_info: self.color_info.as_deref(),
            model_info: self.model_info.as_deref(),
        }
        .serialize(serializer)
    }
}

#[derive(Serialize)]
struct ResultRecord<'a> {
    frame_number: u64,
    timestamp: &'a DateTime<Utc>,
    stream_time: f64,
    frame_width: u32,
    frame_height: u32,
    processing_time: f64,
    number_of_vehicles_detected: usize,
    detected_vehicles: &'a [TrackedVehicle],
}

impl Serialize for DetectionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ResultRecord {
            frame_number: self.frame.sequence,
            timestamp: &self.frame.timestamp,
            stream_time: self.frame.captured_at.as_secs_f64(),
            frame_width: self.frame.width,
            frame_height: self.frame.height,
            processing_time: self.processing_time.as_secs_f64(),
            number_of_vehicles_detected: self.count(),
            detected_vehicles: &self.vehicles,
        }
        .serialize(serializer)
    }
}
