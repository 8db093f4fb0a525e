//! 定长帧通道: 满时新帧替换最旧的未消费帧, 发送端永不阻塞
//! Bounded frame channel with replace-oldest-on-full semantics

use crate::detection::Frame;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 推送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 通道已满, 丢弃了最旧的一帧
    Replaced,
    /// 接收端已关闭
    Closed,
}

/// 接收结果
#[derive(Debug)]
pub enum FrameRecv {
    Frame(Frame),
    Empty,
    /// 发送端已关闭且通道为空 (流结束)
    Closed,
}

/// 采集端
pub struct FrameSender {
    tx: Sender<Frame>,
    // 用于在满时淘汰最旧帧
    evict: Receiver<Frame>,
    // 发送端自己持有接收端克隆, 通道本身不会因处理端退出而断开
    closed: Arc<AtomicBool>,
}

/// 处理端
pub struct FrameReceiver {
    rx: Receiver<Frame>,
    closed: Arc<AtomicBool>,
}

pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    (
        FrameSender {
            tx,
            evict: rx.clone(),
            closed: Arc::clone(&closed),
        },
        FrameReceiver { rx, closed },
    )
}

impl FrameSender {
    /// 非阻塞推送
    pub fn push(&self, frame: Frame) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let mut replaced = false;
        let mut pending = frame;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => {
                    return if replaced {
                        PushOutcome::Replaced
                    } else {
                        PushOutcome::Queued
                    }
                }
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    // 处理端可能恰好取走了一帧, 此时直接重试
                    if self.evict.try_recv().is_ok() {
                        replaced = true;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl FrameReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> FrameRecv {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => FrameRecv::Frame(frame),
            Err(RecvTimeoutError::Timeout) => FrameRecv::Empty,
            Err(RecvTimeoutError::Disconnected) => FrameRecv::Closed,
        }
    }

    pub fn try_recv(&self) -> FrameRecv {
        match self.rx.try_recv() {
            Ok(frame) => FrameRecv::Frame(frame),
            Err(TryRecvError::Empty) => FrameRecv::Empty,
            Err(TryRecvError::Disconnected) => FrameRecv::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Duration::from_millis(seq * 33), RgbImage::new(2, 2))
    }

    #[test]
    fn test_full_channel_replaces_oldest() {
        let (tx, rx) = frame_channel(2);
        assert_eq!(tx.push(frame(1)), PushOutcome::Queued);
        assert_eq!(tx.push(frame(2)), PushOutcome::Queued);
        assert_eq!(tx.push(frame(3)), PushOutcome::Replaced);
        assert_eq!(tx.push(frame(4)), PushOutcome::Replaced);
        assert_eq!(tx.len(), 2);

        let mut seqs = Vec::new();
        while let FrameRecv::Frame(f) = rx.try_recv() {
            seqs.push(f.sequence);
        }
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_dropping_sender_signals_end_of_stream() {
        let (tx, rx) = frame_channel(1);
        tx.push(frame(1));
        drop(tx);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), FrameRecv::Frame(_)));
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)), FrameRecv::Closed));
    }

    #[test]
    fn test_dropping_receiver_closes_sender() {
        let (tx, rx) = frame_channel(2);
        assert_eq!(tx.push(frame(1)), PushOutcome::Queued);
        drop(rx);
        assert_eq!(tx.push(frame(2)), PushOutcome::Closed);
    }

    #[test]
    fn test_empty_channel_times_out() {
        let (_tx, rx) = frame_channel(1);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(5)), FrameRecv::Empty));
    }
}
