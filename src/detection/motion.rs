// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 速度与方向估计
//! Speed / direction estimation from a track's recent center samples

use crate::config::HistoryConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// 8个方向标签 (图像坐标系, y轴向下), 第i个扇区中心为 45°·i
pub const DIRECTION_LABELS: [&str; 8] = [
    "Right",
    "Bottom Right",
    "Bottom",
    "Bottom Left",
    "Left",
    "Top Left",
    "Top",
    "Top Right",
];

pub const UNKNOWN_DIRECTION: &str = "Unknown";

const MPS_TO_KPH: f64 = 3.6;

/// 轨迹采样点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSample {
    pub t: Duration,
    pub x: f64,
    pub y: f64,
}

impl TrackSample {
    pub fn new(t: Duration, x: f64, y: f64) -> Self {
        Self { t, x, y }
    }
}

/// 速度估计 (每帧重新计算, 不单独持久化)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedEstimate {
    pub kph: f64,
    /// 估计可信度 [0, 1], 与检测置信度无关
    pub reliability: f64,
    pub direction_label: &'static str,
    /// atan2(dy, dx), 弧度
    pub direction: f64,
}

impl SpeedEstimate {
    pub fn unknown() -> Self {
        Self {
            kph: 0.0,
            reliability: 0.0,
            direction_label: UNKNOWN_DIRECTION,
            direction: 0.0,
        }
    }
}

/// 角度 → 方向标签
///
/// 扇区 i 覆盖 (45·i − 22.5°, 45·i + 22.5°], 恰好落在边界上的角度归入角度较小的扇区。
pub fn direction_label(degrees: f64) -> &'static str {
    if !degrees.is_finite() {
        return UNKNOWN_DIRECTION;
    }
    let deg = degrees.rem_euclid(360.0);
    let sector = ((deg - 22.5) / 45.0).ceil() as i64;
    DIRECTION_LABELS[sector.rem_euclid(8) as usize]
}

/// 根据采样序列估计速度
///
/// 取回看窗口内时间跨度最大的两个采样点 (窗口内最早的与最新的),
/// 像素位移 × 标定系数 ÷ 时间差 → km/h。
pub fn estimate(samples: &VecDeque<TrackSample>, config: &HistoryConfig) -> SpeedEstimate {
    let n = samples.len();
    if n < 2 {
        return SpeedEstimate::unknown();
    }

    let newest = samples[n - 1];
    let cutoff = newest.t.saturating_sub(config.lookback);
    let first_in_window = samples
        .iter()
        .position(|s| s.t >= cutoff)
        .unwrap_or(n - 1)
        .min(n - 2);
    let oldest = samples[first_in_window];

    let dt = newest.t.saturating_sub(oldest.t).as_secs_f64();
    if dt <= 0.0 {
        return SpeedEstimate::unknown();
    }

    let dx = newest.x - oldest.x;
    let dy = newest.y - oldest.y;
    let displacement = dx.hypot(dy);
    let kph = displacement * config.meters_per_pixel / dt * MPS_TO_KPH;

    let span = samples.range(first_in_window..);
    let reliability = reliability(span, oldest, newest, displacement, config);

    if displacement <= f64::EPSILON {
        return SpeedEstimate {
            kph: 0.0,
            reliability,
            direction_label: UNKNOWN_DIRECTION,
            direction: 0.0,
        };
    }

    let direction = dy.atan2(dx);
    SpeedEstimate {
        kph,
        reliability,
        direction_label: direction_label(direction.to_degrees()),
        direction,
    }
}

/// 可信度 = 采样数因子 × 抖动因子
///
/// 采样数因子随点数线性增长并在 `reliability_saturation` 处封顶;
/// 抖动因子为 1 / (1 + 残差RMS / 位移), 残差取各点到匀速直线插值的距离。
fn reliability<'a>(
    span: impl Iterator<Item = &'a TrackSample>,
    oldest: TrackSample,
    newest: TrackSample,
    displacement: f64,
    config: &HistoryConfig,
) -> f64 {
    let dt = newest.t.saturating_sub(oldest.t).as_secs_f64();
    let mut count = 0usize;
    let mut sq_sum = 0.0;
    for s in span {
        let u = s.t.saturating_sub(oldest.t).as_secs_f64() / dt;
        let ex = oldest.x + (newest.x - oldest.x) * u;
        let ey = oldest.y + (newest.y - oldest.y) * u;
        sq_sum += (s.x - ex).powi(2) + (s.y - ey).powi(2);
        count += 1;
    }
    if count < 2 {
        return 0.0;
    }

    let saturation = config.reliability_saturation.max(2);
    let sample_factor = ((count - 1) as f64 / (saturation - 1) as f64).min(1.0);

    let rms = (sq_sum / count as f64).sqrt();
    let jitter_factor = 1.0 / (1.0 + rms / displacement.max(1.0));

    (sample_factor * jitter_factor).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HistoryConfig {
        HistoryConfig {
            lookback: Duration::from_secs(10),
            window: Duration::from_secs(10),
            meters_per_pixel: 0.1,
            ..Default::default()
        }
    }

    fn linear(n: usize, step_ms: u64, vx: f64, vy: f64) -> VecDeque<TrackSample> {
        (0..n)
            .map(|i| {
                TrackSample::new(
                    Duration::from_millis(i as u64 * step_ms),
                    100.0 + vx * i as f64,
                    100.0 + vy * i as f64,
                )
            })
            .collect()
    }

    #[test]
    fn test_sector_centers() {
        let expected = [
            (0.0, "Right"),
            (45.0, "Bottom Right"),
            (90.0, "Bottom"),
            (135.0, "Bottom Left"),
            (180.0, "Left"),
            (225.0, "Top Left"),
            (270.0, "Top"),
            (315.0, "Top Right"),
            (-90.0, "Top"),
            (360.0, "Right"),
        ];
        for (deg, label) in expected {
            assert_eq!(direction_label(deg), label, "{deg}°");
        }
    }

    #[test]
    fn test_sector_boundaries_resolve_to_lower_sector() {
        assert_eq!(direction_label(22.5), "Right");
        assert_eq!(direction_label(22.6), "Bottom Right");
        assert_eq!(direction_label(67.5), "Bottom Right");
        assert_eq!(direction_label(112.5), "Bottom");
        assert_eq!(direction_label(157.5), "Bottom Left");
        assert_eq!(direction_label(202.5), "Left");
        assert_eq!(direction_label(247.5), "Top Left");
        assert_eq!(direction_label(292.5), "Top");
        assert_eq!(direction_label(337.5), "Top Right");
        assert_eq!(direction_label(337.6), "Right");
        assert_eq!(direction_label(f64::NAN), UNKNOWN_DIRECTION);
    }

    #[test]
    fn test_displacement_vectors_map_to_labels() {
        let vectors = [
            ((1.0, 0.0), "Right"),
            ((1.0, 1.0), "Bottom Right"),
            ((0.0, 1.0), "Bottom"),
            ((-1.0, 1.0), "Bottom Left"),
            ((-1.0, 0.0), "Left"),
            ((-1.0, -1.0), "Top Left"),
            ((0.0, -1.0), "Top"),
            ((1.0, -1.0), "Top Right"),
        ];
        for ((vx, vy), label) in vectors {
            let est = estimate(&linear(3, 100, vx * 10.0, vy * 10.0), &config());
            assert_eq!(est.direction_label, label, "({vx}, {vy})");
        }
    }

    #[test]
    fn test_fewer_than_two_samples_is_unknown() {
        assert_eq!(estimate(&VecDeque::new(), &config()), SpeedEstimate::unknown());
        let one = linear(1, 100, 10.0, 0.0);
        let est = estimate(&one, &config());
        assert_eq!(est.direction_label, "Unknown");
        assert_eq!(est.reliability, 0.0);
        assert_eq!(est.kph, 0.0);
    }

    #[test]
    fn test_constant_velocity_speed() {
        // 10px/帧 @10fps, 0.1 m/px → 10 m/s → 36 km/h
        let est = estimate(&linear(5, 100, 10.0, 0.0), &config());
        assert!((est.kph - 36.0).abs() < 1e-6, "kph = {}", est.kph);
        assert_eq!(est.direction_label, "Right");
        assert!(est.direction.abs() < 1e-9);
    }

    #[test]
    fn test_reliability_grows_with_samples_until_cap() {
        let cfg = config();
        let mut last = 0.0;
        for n in 2..=cfg.reliability_saturation {
            let r = estimate(&linear(n, 100, 5.0, 5.0), &cfg).reliability;
            assert!(r > last, "n={n}: {r} <= {last}");
            last = r;
        }
        assert!((last - 1.0).abs() < 1e-9);
        let capped = estimate(&linear(cfg.reliability_saturation + 5, 100, 5.0, 5.0), &cfg);
        assert!((capped.reliability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_lowers_reliability() {
        let cfg = config();
        let smooth = linear(8, 100, 10.0, 0.0);
        let mut jittery = smooth.clone();
        for (i, s) in jittery.iter_mut().enumerate().skip(1).take(6) {
            s.y += if i % 2 == 0 { 15.0 } else { -15.0 };
        }
        let a = estimate(&smooth, &cfg).reliability;
        let b = estimate(&jittery, &cfg).reliability;
        assert!(b < a, "jittery {b} >= smooth {a}");
    }

    #[test]
    fn test_lookback_limits_span() {
        let cfg = HistoryConfig {
            lookback: Duration::from_millis(200),
            meters_per_pixel: 1.0,
            ..config()
        };
        // 前半段静止, 后半段 10px/100ms
        let mut samples: VecDeque<TrackSample> = (0..5)
            .map(|i| TrackSample::new(Duration::from_millis(i * 100), 0.0, 0.0))
            .collect();
        for i in 1..=3u64 {
            samples.push_back(TrackSample::new(
                Duration::from_millis(400 + i * 100),
                10.0 * i as f64,
                0.0,
            ));
        }
        let est = estimate(&samples, &cfg);
        // 窗口内: 500ms..700ms, 10px → 20px ... 30px, 即 20px / 0.2s = 100 px/s
        assert!((est.kph - 100.0 * 3.6).abs() < 1e-6, "kph = {}", est.kph);
    }

    #[test]
    fn test_stationary_track() {
        let est = estimate(&linear(4, 100, 0.0, 0.0), &config());
        assert_eq!(est.kph, 0.0);
        assert_eq!(est.direction_label, UNKNOWN_DIRECTION);
        assert!(est.reliability > 0.0);
    }
}
