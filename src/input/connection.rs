//! 单次流连接接口
//! A single attempt at a live stream: open, read, report health, close

use crate::config::StreamConfig;
use crate::error::StreamError;
use image::RgbImage;
use serde::Serialize;
use std::time::Duration;

/// 流属性 (连接成功后可用)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamProperties {
    pub width: u32,
    pub height: u32,
    /// 源帧率 (未知时为 0)
    pub fps: f64,
    pub is_live: bool,
}

/// 已打开的传输句柄, 只由 ConnectionManager 持有
pub trait StreamConnection: Send {
    /// 读取下一帧, 最多等待 `timeout`
    fn read_frame(&mut self, timeout: Duration) -> Result<RgbImage, StreamError>;

    fn properties(&self) -> Option<StreamProperties>;

    fn is_healthy(&self) -> bool;

    /// 释放底层资源 (可重复调用)
    fn close(&mut self);
}

/// 连接工厂: 每次调用都是一次新的连接尝试
pub trait Connector: Send {
    fn open(&mut self, config: &StreamConfig) -> Result<Box<dyn StreamConnection>, StreamError>;
}

impl<F> Connector for F
where
    F: FnMut(&StreamConfig) -> Result<Box<dyn StreamConnection>, StreamError> + Send,
{
    fn open(&mut self, config: &StreamConfig) -> Result<Box<dyn StreamConnection>, StreamError> {
        self(config)
    }
}
