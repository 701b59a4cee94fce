//! Bounded frame queues between the pipeline stages
//!
//! Each direction of the session has one `FrameBuffer` decoupling producer
//! and consumer rates: capture/network on the outbound side, network/playback
//! on the inbound side. Every buffer has exactly one producer task and one
//! consumer task, so strict FIFO order is preserved end to end.
//!
//! The two directions use different overflow policies. Outbound audio drops
//! the oldest frame so what reaches the server stays recent; inbound audio
//! holds the producer instead, pushing backpressure into the socket reader
//! rather than losing anything queued for the speaker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Direction of an audio frame relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One unit of fixed-duration audio, raw PCM or encoded
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Frame payload (s16le PCM or an Opus packet)
    pub payload: Bytes,
    /// Monotonically increasing per-direction sequence number
    pub sequence: u64,
    /// Which way the frame is travelling
    pub direction: Direction,
}

impl AudioFrame {
    pub fn new(payload: Bytes, sequence: u64, direction: Direction) -> Self {
        Self {
            payload,
            sequence,
            direction,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Behavior when a push finds the buffer at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest frame to admit the newest
    DropOldest,
    /// Hold the producer until the consumer frees a slot
    Block,
}

/// Returned by `push` once the buffer has been closed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("frame buffer is closed")]
pub struct BufferClosed;

struct Inner {
    queue: VecDeque<AudioFrame>,
    closed: bool,
    last_sequence: Option<u64>,
}

/// Bounded FIFO of audio frames
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

/// Shared handle to a frame buffer
pub type SharedFrameBuffer = Arc<FrameBuffer>;

impl FrameBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                last_sequence: None,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a shared frame buffer
    pub fn shared(capacity: usize, policy: OverflowPolicy) -> SharedFrameBuffer {
        Arc::new(Self::new(capacity, policy))
    }

    /// Insert a frame at the tail.
    ///
    /// At capacity this either evicts the head (`DropOldest`) or waits for
    /// the consumer (`Block`). Completes with `Err` once the buffer is
    /// closed, waking immediately if it was closed while waiting.
    pub async fn push(&self, frame: AudioFrame) -> Result<(), BufferClosed> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(BufferClosed);
                }
                if let Some(last) = inner.last_sequence {
                    debug_assert!(
                        frame.sequence > last,
                        "sequence went backwards: {} after {}",
                        frame.sequence,
                        last
                    );
                }

                if inner.queue.len() < self.capacity {
                    inner.last_sequence = Some(frame.sequence);
                    inner.queue.push_back(frame);
                    self.not_empty.notify_one();
                    return Ok(());
                }

                if self.policy == OverflowPolicy::DropOldest {
                    if let Some(evicted) = inner.queue.pop_front() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(sequence = evicted.sequence, "evicted oldest frame");
                    }
                    inner.last_sequence = Some(frame.sequence);
                    inner.queue.push_back(frame);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Remove the frame at the head, waiting while the buffer is empty.
    ///
    /// After `close()` remaining frames are still handed out in order;
    /// `None` is returned only once the buffer is closed and drained.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.queue.pop_front() {
                    self.not_full.notify_one();
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Non-waiting variant of `pop`
    pub fn try_pop(&self) -> Option<AudioFrame> {
        let mut inner = self.inner.lock();
        let frame = inner.queue.pop_front();
        if frame.is_some() {
            self.not_full.notify_one();
        }
        frame
    }

    /// Discard all queued frames, returning how many were flushed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let flushed = inner.queue.len();
        inner.queue.clear();
        if flushed > 0 {
            self.not_full.notify_one();
        }
        flushed
    }

    /// Mark the buffer closed and wake every waiting producer/consumer.
    /// Queued frames are retained for draining. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted under the `DropOldest` policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(sequence: u64) -> AudioFrame {
        AudioFrame::new(
            Bytes::from(sequence.to_le_bytes().to_vec()),
            sequence,
            Direction::Outbound,
        )
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let buffer = FrameBuffer::new(8, OverflowPolicy::Block);

        for sequence in 1..=5 {
            buffer.push(frame(sequence)).await.unwrap();
        }
        for sequence in 1..=5 {
            assert_eq!(buffer.pop().await.unwrap().sequence, sequence);
        }
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_head() {
        let buffer = FrameBuffer::new(3, OverflowPolicy::DropOldest);

        for sequence in 1..=5 {
            buffer.push(frame(sequence)).await.unwrap();
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        // The newest three survive, still in order
        assert_eq!(buffer.pop().await.unwrap().sequence, 3);
        assert_eq!(buffer.pop().await.unwrap().sequence, 4);
        assert_eq!(buffer.pop().await.unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn test_block_policy_holds_producer() {
        let buffer = FrameBuffer::shared(2, OverflowPolicy::Block);
        buffer.push(frame(1)).await.unwrap();
        buffer.push(frame(2)).await.unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(frame(3)).await })
        };

        // The producer must still be waiting
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(buffer.len(), 2);

        // Freeing one slot releases it
        assert_eq!(buffer.pop().await.unwrap().sequence, 1);
        producer.await.unwrap().unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let buffer = FrameBuffer::shared(2, OverflowPolicy::Block);

        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let buffer = FrameBuffer::shared(1, OverflowPolicy::Block);
        buffer.push(frame(1)).await.unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(frame(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert_eq!(producer.await.unwrap(), Err(BufferClosed));
    }

    #[tokio::test]
    async fn test_close_retains_frames_for_drain() {
        let buffer = FrameBuffer::new(4, OverflowPolicy::Block);
        buffer.push(frame(1)).await.unwrap();
        buffer.push(frame(2)).await.unwrap();

        buffer.close();

        // Queued audio survives the close and drains in order
        assert_eq!(buffer.pop().await.unwrap().sequence, 1);
        assert_eq!(buffer.pop().await.unwrap().sequence, 2);
        assert!(buffer.pop().await.is_none());
        assert_eq!(buffer.push(frame(3)).await, Err(BufferClosed));
    }

    #[tokio::test]
    async fn test_clear_flushes_queue() {
        let buffer = FrameBuffer::new(4, OverflowPolicy::Block);
        buffer.push(frame(1)).await.unwrap();
        buffer.push(frame(2)).await.unwrap();

        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());

        // Later pushes still work and keep their order
        buffer.push(frame(3)).await.unwrap();
        assert_eq!(buffer.pop().await.unwrap().sequence, 3);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let buffer = FrameBuffer::new(4, OverflowPolicy::DropOldest);
            for sequence in 1..=100 {
                buffer.push(frame(sequence)).await.unwrap();
                assert!(buffer.len() <= buffer.capacity());
            }
        });
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any push sequence under capacity pops back in exactly that order
            #[test]
            fn fifo_order_preserved(count in 1usize..32) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                rt.block_on(async {
                    let buffer = FrameBuffer::new(32, OverflowPolicy::Block);
                    for sequence in 1..=count as u64 {
                        buffer.push(frame(sequence)).await.unwrap();
                    }
                    for sequence in 1..=count as u64 {
                        prop_assert_eq!(buffer.pop().await.unwrap().sequence, sequence);
                    }
                    Ok(())
                })?;
            }

            // Under overflow the survivors are always the newest suffix, in order
            #[test]
            fn drop_oldest_keeps_newest_suffix(count in 1usize..64, capacity in 1usize..8) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                rt.block_on(async {
                    let buffer = FrameBuffer::new(capacity, OverflowPolicy::DropOldest);
                    for sequence in 1..=count as u64 {
                        buffer.push(frame(sequence)).await.unwrap();
                        prop_assert!(buffer.len() <= capacity);
                    }

                    let expected_start = (count.saturating_sub(capacity) + 1) as u64;
                    for sequence in expected_start..=count as u64 {
                        prop_assert_eq!(buffer.pop().await.unwrap().sequence, sequence);
                    }
                    prop_assert!(buffer.is_empty());
                    Ok(())
                })?;
            }
        }
    }
}
