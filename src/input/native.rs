// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 进程内 FFmpeg 拉流 (ez-ffmpeg, 需要 `ffmpeg-native` 特性)
/// In-process RTSP decoding through ez-ffmpeg frame filters
use super::connection::{Connector, StreamConnection, StreamProperties};
use super::ffmpeg::{is_live_endpoint, offer, redact, wait_first_frame, FrameFeed, FEED_DEPTH};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crossbeam_channel::{bounded, never, RecvTimeoutError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 关闭时轮询解码线程是否退出的间隔
const JOIN_POLL: Duration = Duration::from_millis(10);

/// FFmpeg解码过滤器: 视频帧(rgb24) → RgbImage
struct RgbCaptureFilter {
    tx: Sender<Result<RgbImage, StreamError>>,
    stop: Arc<AtomicBool>,
    dropped_frames: usize,
}

impl FrameFilter for RgbCaptureFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("decode filter initialised");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        // 连接已关闭, 让 FFmpeg 停止
        if self.stop.load(Ordering::Relaxed) {
            return Err("connection closed".to_string());
        }

        unsafe {
            // 空帧或损坏帧直接丢弃
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as u32;
            let h = (*frame.as_ptr()).height as u32;
            let data = (*frame.as_ptr()).data[0];
            let stride = (*frame.as_ptr()).linesize[0] as usize;
            let row_bytes = w as usize * 3;

            if w == 0 || h == 0 || data.is_null() || stride < row_bytes {
                self.dropped_frames += 1;
                return Ok(None);
            }

            // 按行拷贝 (去掉行尾对齐填充)
            let mut pixels = Vec::with_capacity(row_bytes * h as usize);
            for row in 0..h as usize {
                let src = std::slice::from_raw_parts(data.add(row * stride), row_bytes);
                pixels.extend_from_slice(src);
            }

            match RgbImage::from_raw(w, h, pixels) {
                Some(image) => {
                    if !offer(&self.tx, image) {
                        return Err("receiver dropped".to_string());
                    }
                }
                None => self.dropped_frames += 1,
            }
        }

        Ok(Some(frame))
    }
}

/// ez-ffmpeg 连接器
#[derive(Debug, Clone)]
pub struct NativeConnector {
    output_size: (u32, u32),
}

impl Default for NativeConnector {
    fn default() -> Self {
        Self {
            output_size: (1280, 720),
        }
    }
}

impl NativeConnector {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            output_size: (width, height),
        }
    }
}

impl Connector for NativeConnector {
    fn open(&mut self, config: &StreamConfig) -> Result<Box<dyn StreamConnection>, StreamError> {
        let endpoint = config.endpoint.clone();
        let (width, height) = self.output_size;
        let (tx, rx) = bounded(FEED_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));

        let filter = RgbCaptureFilter {
            tx: tx.clone(),
            stop: Arc::clone(&stop),
            dropped_frames: 0,
        };
        let url = endpoint.clone();
        let opts = input_opts(&endpoint, config.read_timeout);
        let worker = thread::Builder::new()
            .name("ffmpeg-native".into())
            .spawn(move || decode(&url, opts, width, height, filter, tx))
            .map_err(StreamError::Io)?;

        let mut connection = NativeConnection {
            frames: rx,
            pending: None,
            stop,
            worker: Some(worker),
            close_wait: config.read_timeout,
            properties: StreamProperties {
                width,
                height,
                fps: 0.0,
                is_live: is_live_endpoint(&endpoint),
            },
        };

        match wait_first_frame(&connection.frames, config.read_timeout) {
            Ok(first) => {
                info!(endpoint = %redact(&endpoint), width, height, "✅ native decoder running");
                connection.pending = Some(first);
                Ok(Box::new(connection))
            }
            Err(err) => {
                connection.close();
                Err(match err {
                    StreamError::Timeout(_) => err,
                    other => StreamError::Open {
                        endpoint: redact(&endpoint),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }
}

/// 输入选项; 网络输入带套接字读超时 (微秒), 卡住的读取按时返回
fn input_opts(url: &str, timeout: Duration) -> HashMap<String, String> {
    let micros = timeout.as_micros().to_string();
    let mut opts = HashMap::new();
    if url.to_ascii_lowercase().starts_with("rtsp") {
        opts.insert("rtsp_transport".to_string(), "tcp".to_string());
        opts.insert("rtsp_flags".to_string(), "prefer_tcp".to_string());
        opts.insert("timeout".to_string(), micros);
    } else if is_live_endpoint(url) {
        opts.insert("rw_timeout".to_string(), micros);
    }
    opts
}

/// 解码线程: 构建 FFmpeg 上下文并阻塞到流结束
fn decode(
    url: &str,
    opts: HashMap<String, String>,
    width: u32,
    height: u32,
    filter: RgbCaptureFilter,
    tx: Sender<Result<RgbImage, StreamError>>,
) {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("rgb-capture", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let mut input = Input::new(url);
    if !opts.is_empty() {
        input = input.set_input_opts(opts);
    }

    let desc = format!("scale={width}:{height},format=rgb24");
    let ctx = match FfmpegContext::builder()
        .input(input)
        .filter_desc(desc.as_str())
        .output(out)
        .build()
    {
        Ok(ctx) => ctx,
        Err(err) => {
            let _ = tx.send(Err(StreamError::Disconnected(format!("build failed: {err}"))));
            return;
        }
    };

    match ctx.start() {
        Ok(sch) => {
            let _ = sch.wait();
            let _ = tx.send(Err(StreamError::EndOfStream));
        }
        Err(err) => {
            warn!(%err, "native decoder failed to start");
            let _ = tx.send(Err(StreamError::Disconnected(format!("start failed: {err}"))));
        }
    }
}

pub struct NativeConnection {
    frames: FrameFeed,
    pending: Option<RgbImage>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    /// 关闭时等待解码线程退出的上限
    close_wait: Duration,
    properties: StreamProperties,
}

impl StreamConnection for NativeConnection {
    fn read_frame(&mut self, timeout: Duration) -> Result<RgbImage, StreamError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        match self.frames.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StreamError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::EndOfStream),
        }
    }

    fn properties(&self) -> Option<StreamProperties> {
        Some(self.properties)
    }

    fn is_healthy(&self) -> bool {
        // 解码线程结束后仍需读完队列中的剩余帧和结束标记
        !self.stop.load(Ordering::Relaxed)
            && (!self.frames.is_empty()
                || self.worker.as_ref().is_some_and(|w| !w.is_finished()))
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.pending = None;
        self.frames = never();
        let Some(worker) = self.worker.take() else {
            return;
        };
        // 解码线程在下一帧或套接字读超时后退出
        let deadline = Instant::now() + self.close_wait;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if worker.is_finished() {
            let _ = worker.join();
        } else {
            warn!(wait = ?self.close_wait, "native decoder still blocked, detaching");
        }
    }
}

impl Drop for NativeConnection {
    fn drop(&mut self) {
        self.close();
    }
}
