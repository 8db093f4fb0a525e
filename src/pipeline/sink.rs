//! 结果持久化
//! Persistence collaborators for detection results

use crate::detection::DetectionResult;
use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// 持久化接口 (可选), 失败只记录不影响流水线
pub trait ResultSink: Send {
    fn persist(&mut self, result: &DetectionResult) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 每行一个JSON结果
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    written: u64,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("failed to create result file {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ResultSink for JsonLinesSink<W> {
    fn persist(&mut self, result: &DetectionResult) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, result)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detection, Frame, SpeedEstimate, TrackId, TrackedVehicle};
    use image::RgbImage;
    use std::time::Duration;

    fn result(seq: u64) -> DetectionResult {
        DetectionResult {
            frame: Frame::new(seq, Duration::from_millis(seq * 100), RgbImage::new(8, 8)).info(),
            vehicles: vec![TrackedVehicle {
                id: TrackId(seq),
                detection: Detection::new(BBox::new(1.0, 2.0, 3.0, 4.0), "bus", 0.8),
                speed: SpeedEstimate::unknown(),
                color_info: None,
                model_info: None,
            }],
            processing_time: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_json_lines_one_document_per_result() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.persist(&result(1)).unwrap();
        sink.persist(&result(2)).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.written(), 2);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["frame_number"], 2);
        assert_eq!(second["detected_vehicles"][0]["vehicle_type"], "bus");
    }
}
