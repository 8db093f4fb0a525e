//! 错误类型定义
//! Error types for the stream, model and dispatch layers

use std::time::Duration;
use thiserror::Error;

/// 视频流错误 (连接 / 读取)
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open stream {endpoint:?}: {reason}")]
    Open { endpoint: String, reason: String },

    #[error("authentication rejected by {endpoint:?}")]
    Auth { endpoint: String },

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("stream ended")]
    EndOfStream,

    #[error("stream is not connected")]
    NotConnected,

    #[error("reconnecting, next attempt in {retry_in:?}")]
    Reconnecting { retry_in: Duration },

    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// 终止性错误: 连接预算耗尽, 流水线必须停止
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::MaxRetriesExceeded { .. })
    }

    /// 瞬时错误: 采集循环可以等待后继续
    pub fn is_transient(&self) -> bool {
        !self.is_terminal()
    }
}

/// 外部模型错误 (检测器 / 跟踪器 / 分类器)
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("detector failed: {0}")]
    Detector(String),

    #[error("tracker failed: {0}")]
    Tracker(String),

    #[error("classifier failed: {0}")]
    Classifier(String),

    #[error("inference worker is gone")]
    WorkerGone,

    #[error("frame {0} abandoned after model timeout")]
    Abandoned(u64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 结果分发错误
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a result callback is already registered")]
    CallbackAlreadyRegistered,

    #[error("a result subscriber is already registered")]
    SubscriberAlreadyRegistered,
}

/// 流水线顶层错误
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("pipeline is missing its {0}")]
    MissingComponent(&'static str),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exhausted_budget_is_terminal() {
        assert!(StreamError::MaxRetriesExceeded { attempts: 3 }.is_terminal());
        assert!(StreamError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(StreamError::EndOfStream.is_transient());
        assert!(StreamError::Reconnecting {
            retry_in: Duration::ZERO
        }
        .is_transient());
    }

    #[test]
    fn test_max_retries_message() {
        let err = StreamError::MaxRetriesExceeded { attempts: 3 };
        assert!(err.to_string().contains("max retries exceeded"));
    }
}
