//! In-memory transport pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Frame, FrameTransport, TransportError};

/// One end of an in-process frame pipe created by [`ChannelTransport::pair`].
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    /// Bytes we sent that the other end has not received yet.
    outbound: Arc<AtomicUsize>,
    /// Bytes the other end sent that we have not received yet.
    inbound: Arc<AtomicUsize>,
}

impl ChannelTransport {
    /// Creates two connected ends.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        let a_to_b = Arc::new(AtomicUsize::new(0));
        let b_to_a = Arc::new(AtomicUsize::new(0));

        let a = ChannelTransport {
            tx: Some(to_b),
            rx: from_b,
            outbound: Arc::clone(&a_to_b),
            inbound: Arc::clone(&b_to_a),
        };
        let b = ChannelTransport {
            tx: Some(to_a),
            rx: from_a,
            outbound: b_to_a,
            inbound: a_to_b,
        };
        (a, b)
    }

    fn take(&self, frame: Frame) -> Frame {
        self.inbound.fetch_sub(frame.len(), Ordering::AcqRel);
        frame
    }
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        let len = frame.len();
        self.outbound.fetch_add(len, Ordering::AcqRel);
        tx.send(frame).map_err(|_| {
            self.outbound.fetch_sub(len, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    async fn recv(&mut self) -> Option<Frame> {
        let frame = self.rx.recv().await?;
        Some(self.take(frame))
    }

    fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(frame) = self.rx.try_recv() {
            self.take(frame);
            dropped += 1;
        }
        dropped
    }

    fn buffered_amount(&self) -> usize {
        self.outbound.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_arrive_in_order_with_kind_preserved() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(Frame::Text("hello".into())).await.unwrap();
        a.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(b.recv().await, Some(Frame::Text("hello".into())));
        assert_eq!(b.recv().await, Some(Frame::Binary(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_buffered_amount_drains_on_receive() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(Frame::Binary(vec![0; 100])).await.unwrap();
        assert_eq!(a.buffered_amount(), 100);

        b.recv().await;
        assert_eq!(a.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(Frame::Text("last".into())).await.unwrap();
        a.close().await;

        assert_eq!(b.recv().await, Some(Frame::Text("last".into())));
        assert_eq!(b.recv().await, None);
        assert!(a.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_discard_pending_drops_stale_frames() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(Frame::Text("stale".into())).await.unwrap();
        a.send(Frame::Binary(vec![9])).await.unwrap();

        assert_eq!(b.discard_pending(), 2);
        assert_eq!(a.buffered_amount(), 0);
    }
}
