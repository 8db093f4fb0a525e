//! 连接管理器 - 带重试上限的连接状态机
//! Connection state machine with a hard attempt ceiling
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!                              │  ▲                │ 读取失败
//!                         失败 │  │ 到期重试          ▼
//!                              ▼  │            Reconnecting
//!                        (attempts == max) ──────▶ Failed
//! ```

use super::connection::{Connector, StreamConnection, StreamProperties};
use crate::config::StreamConfig;
use crate::error::StreamError;
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Failed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Failed,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Failed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 跨线程只读视图 (采集线程写, 其他线程读)
#[derive(Debug)]
pub struct ConnectionMonitor {
    state: AtomicU8,
    attempts: AtomicU32,
    reconnects: AtomicU64,
}

impl ConnectionMonitor {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            attempts: AtomicU32::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 当前已消耗的连接尝试次数
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// 连接丢失 (进入 Reconnecting) 的累计次数
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// 连接状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub max_retries: u32,
    pub reconnects: u64,
    pub time_since_last_frame: Option<Duration>,
    pub properties: Option<StreamProperties>,
    pub last_error: Option<String>,
}

/// 连接管理器, 唯一可以创建/销毁 StreamConnection 的组件
pub struct ConnectionManager {
    config: StreamConfig,
    connector: Box<dyn Connector>,
    connection: Option<Box<dyn StreamConnection>>,
    state: ConnectionState,
    /// 已消耗的尝试次数 (整个流生命周期共享)
    attempts: u32,
    /// 重连后连续成功读取的帧数
    healthy_reads: u32,
    next_attempt_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    properties: Option<StreamProperties>,
    /// 最近一次连接/读取失败的原因
    last_error: Option<String>,
    monitor: Arc<ConnectionMonitor>,
}

impl ConnectionManager {
    pub fn new(config: StreamConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            connection: None,
            state: ConnectionState::Disconnected,
            attempts: 0,
            healthy_reads: 0,
            next_attempt_at: None,
            last_frame_at: None,
            properties: None,
            last_error: None,
            monitor: Arc::new(ConnectionMonitor::new()),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn properties(&self) -> Option<StreamProperties> {
        self.properties
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn monitor(&self) -> Arc<ConnectionMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempts: self.attempts,
            max_retries: self.config.max_retries,
            reconnects: self.monitor.reconnects(),
            time_since_last_frame: self.last_frame_at.map(|t| t.elapsed()),
            properties: self.properties,
            last_error: self.last_error.clone(),
        }
    }

    /// 距离下一次允许的连接尝试还需等待多久
    pub fn retry_wait(&self) -> Duration {
        self.next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "connection state changed");
        }
        self.state = state;
        self.monitor.state.store(state as u8, Ordering::Release);
    }

    fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
        self.monitor.attempts.store(attempts, Ordering::Relaxed);
    }

    fn exhausted(&self) -> StreamError {
        StreamError::MaxRetriesExceeded {
            attempts: self.attempts,
        }
    }

    fn fail(&mut self) -> StreamError {
        self.release();
        self.set_state(ConnectionState::Failed);
        error!(
            endpoint = %self.config.endpoint,
            attempts = self.attempts,
            "❌ max retries exceeded, giving up"
        );
        self.exhausted()
    }

    fn release(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
    }

    /// 执行一次连接尝试 (不等待)
    fn attempt(&mut self) -> Result<(), StreamError> {
        if self.state == ConnectionState::Failed {
            return Err(self.exhausted());
        }
        if self.attempts >= self.config.max_retries {
            return Err(self.fail());
        }

        let resume = match self.state {
            ConnectionState::Reconnecting => ConnectionState::Reconnecting,
            _ => ConnectionState::Connecting,
        };
        self.set_state(ConnectionState::Connecting);
        self.set_attempts(self.attempts + 1);
        info!(
            endpoint = %self.config.endpoint,
            attempt = self.attempts,
            max = self.config.max_retries,
            "🔌 connecting"
        );

        match self.connector.open(&self.config) {
            Ok(conn) => {
                self.properties = conn.properties();
                self.connection = Some(conn);
                self.healthy_reads = 0;
                self.next_attempt_at = None;
                self.set_state(ConnectionState::Connected);
                match self.properties {
                    Some(p) => info!(
                        width = p.width,
                        height = p.height,
                        fps = p.fps,
                        live = p.is_live,
                        "✅ stream connected"
                    ),
                    None => info!("✅ stream connected"),
                }
                Ok(())
            }
            Err(err) => {
                warn!(attempt = self.attempts, %err, "⚠️ connection attempt failed");
                self.last_error = Some(err.to_string());
                if self.attempts >= self.config.max_retries {
                    return Err(self.fail());
                }
                self.next_attempt_at = Some(Instant::now() + self.config.retry_delay);
                self.set_state(resume);
                Err(err)
            }
        }
    }

    /// 到期时执行一次连接尝试; 未到期返回 `Reconnecting { retry_in }`
    pub fn poll_connect(&mut self) -> Result<(), StreamError> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Failed => return Err(self.exhausted()),
            _ => {}
        }
        let retry_in = self.retry_wait();
        if !retry_in.is_zero() {
            return Err(StreamError::Reconnecting { retry_in });
        }
        self.attempt()
    }

    /// 阻塞连接, 失败后等待 retry_delay 重试, 直到成功或耗尽重试次数
    pub fn connect(&mut self) -> Result<(), StreamError> {
        loop {
            match self.poll_connect() {
                Ok(()) => return Ok(()),
                Err(err) if err.is_terminal() => return Err(err),
                Err(_) => thread::sleep(self.retry_wait()),
            }
        }
    }

    /// 读取一帧
    ///
    /// 读取失败时释放连接并进入 Reconnecting, 本次返回瞬时错误;
    /// 之后的调用按重试节奏自动重连。
    pub fn read_frame(&mut self) -> Result<RgbImage, StreamError> {
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::Reconnecting => self.poll_connect()?,
            ConnectionState::Failed => return Err(self.exhausted()),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(StreamError::NotConnected)
            }
        }

        // 连接自报不健康时不再读取, 直接按断线处理
        if self.connection.as_ref().is_some_and(|c| !c.is_healthy()) {
            let err = StreamError::Disconnected("connection reported unhealthy".into());
            self.handle_loss(&err);
            return Err(err);
        }

        let timeout = self.config.read_timeout;
        let Some(conn) = self.connection.as_mut() else {
            return Err(StreamError::NotConnected);
        };

        match conn.read_frame(timeout) {
            Ok(frame) => {
                self.last_frame_at = Some(Instant::now());
                self.healthy_reads = self.healthy_reads.saturating_add(1);
                if self.attempts > 0 && self.healthy_reads >= self.config.healthy_reads_before_reset
                {
                    debug!(reads = self.healthy_reads, "stream healthy, retry budget restored");
                    self.set_attempts(0);
                }
                Ok(frame)
            }
            Err(err) => {
                self.handle_loss(&err);
                Err(err)
            }
        }
    }

    fn handle_loss(&mut self, err: &StreamError) {
        warn!(
            endpoint = %self.config.endpoint,
            %err,
            attempts = self.attempts,
            "📡 stream read failed, reconnecting"
        );
        self.last_error = Some(err.to_string());
        self.release();
        self.healthy_reads = 0;
        // 第一次重连立即进行, 之后按 retry_delay
        self.next_attempt_at = None;
        self.monitor.reconnects.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Reconnecting);
    }

    /// 关闭连接 (任意状态可调用, 幂等)
    pub fn close(&mut self) {
        self.release();
        self.set_attempts(0);
        self.healthy_reads = 0;
        self.next_attempt_at = None;
        if self.state != ConnectionState::Disconnected {
            info!(endpoint = %self.config.endpoint, "🔌 stream closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.release();
    }
}
