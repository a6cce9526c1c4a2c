//! Per-session flow control buffer
//!
//! Bounded FIFO of output chunks, accounted in bytes, sitting between a
//! session's transport pump and the owning connection's write loop. Two
//! thresholds drive backpressure: crossing `high_watermark` emits one
//! `Pause`, draining back below `low_watermark` emits one `Resume`
//! (hysteresis, no flapping). The hard cap is never exceeded; beyond it the
//! oldest chunks are dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// Watermark configuration, in bytes. `low < high <= hard_cap`.
#[derive(Debug, Clone, Copy)]
pub struct FlowControlConfig {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub hard_cap: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            high_watermark: 512 * 1024,
            low_watermark: 128 * 1024,
            hard_cap: 2 * 1024 * 1024,
        }
    }
}

/// Watermark crossing events, consumed by the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
}

struct Inner {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    paused: bool,
    dropped_chunks: u64,
    /// Wakes the owning connection's write loop; absent while the session
    /// is orphaned in the grace window.
    drain_waker: Option<Arc<Notify>>,
}

/// Bounded output queue for one session.
pub struct OutputBuffer {
    inner: Mutex<Inner>,
    high_watermark: usize,
    low_watermark: usize,
    hard_cap: usize,
    flow_tx: mpsc::UnboundedSender<FlowSignal>,
}

impl OutputBuffer {
    /// Create a buffer plus the receiver for its flow signals.
    pub fn new(config: FlowControlConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<FlowSignal>) {
        let (flow_tx, flow_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: Mutex::new(Inner {
                    chunks: VecDeque::new(),
                    bytes: 0,
                    paused: false,
                    dropped_chunks: 0,
                    drain_waker: None,
                }),
                high_watermark: config.high_watermark,
                low_watermark: config.low_watermark,
                hard_cap: config.hard_cap,
                flow_tx,
            }),
            flow_rx,
        )
    }

    /// Append a chunk. Drops the oldest chunks only past the hard cap.
    pub fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        let waker = {
            let mut inner = self.inner.lock();

            inner.bytes += chunk.len();
            inner.chunks.push_back(chunk);

            // Enforce the hard cap, preferring backpressure over data loss
            // up to this point.
            while inner.bytes > self.hard_cap && inner.chunks.len() > 1 {
                if let Some(dropped) = inner.chunks.pop_front() {
                    inner.bytes -= dropped.len();
                    inner.dropped_chunks += 1;
                }
            }
            if inner.bytes > self.hard_cap {
                // A single chunk larger than the cap; keep only its tail.
                let excess = inner.bytes - self.hard_cap;
                let cut = match inner.chunks.front_mut() {
                    Some(front) => {
                        let cut = excess.min(front.len());
                        let _ = front.split_to(cut);
                        cut
                    }
                    None => 0,
                };
                if cut > 0 {
                    inner.bytes -= cut;
                    inner.dropped_chunks += 1;
                    warn!("Output chunk exceeded hard cap, truncated");
                }
            }

            if !inner.paused && inner.bytes >= self.high_watermark {
                inner.paused = true;
                let _ = self.flow_tx.send(FlowSignal::Pause);
            }

            inner.drain_waker.clone()
        };

        if let Some(waker) = waker {
            waker.notify_one();
        }
    }

    /// Remove up to `max_bytes` of whole chunks, oldest first. Chunks are
    /// never split, so UTF-8-complete chunk boundaries survive the trip to
    /// the write loop. Returns an empty vec when the buffer is empty.
    pub fn drain(&self, max_bytes: usize) -> Vec<Bytes> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::new();
        let mut taken = 0;

        while let Some(front) = inner.chunks.front() {
            if !drained.is_empty() && taken + front.len() > max_bytes {
                break;
            }
            let chunk = inner.chunks.pop_front().expect("front checked above");
            inner.bytes -= chunk.len();
            taken += chunk.len();
            drained.push(chunk);
        }

        if inner.paused && inner.bytes <= self.low_watermark {
            inner.paused = false;
            let _ = self.flow_tx.send(FlowSignal::Resume);
        }

        drained
    }

    /// Attach or detach the write-loop waker. Attaching with a backlog
    /// wakes the loop immediately so buffered output is delivered after a
    /// rebind.
    pub fn set_drain_waker(&self, waker: Option<Arc<Notify>>) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.drain_waker = waker.clone();
            !inner.chunks.is_empty()
        };
        if pending {
            if let Some(waker) = waker {
                waker.notify_one();
            }
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunks.is_empty()
    }

    /// Chunks sacrificed to the hard cap since creation.
    pub fn dropped_chunks(&self) -> u64 {
        self.inner.lock().dropped_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn small_config() -> FlowControlConfig {
        FlowControlConfig {
            high_watermark: 1000,
            low_watermark: 300,
            hard_cap: 2000,
        }
    }

    fn chunk(n: usize) -> Bytes {
        Bytes::from(vec![b'x'; n])
    }

    #[test]
    fn test_push_drain_fifo() {
        let (buffer, _flow) = OutputBuffer::new(small_config());
        buffer.push(Bytes::from_static(b"one"));
        buffer.push(Bytes::from_static(b"two"));

        let drained = buffer.drain(usize::MAX);
        assert_eq!(drained, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_respects_max_but_yields_at_least_one_chunk() {
        let (buffer, _flow) = OutputBuffer::new(small_config());
        buffer.push(chunk(100));
        buffer.push(chunk(100));
        buffer.push(chunk(100));

        let drained = buffer.drain(150);
        assert_eq!(drained.len(), 1);

        // A single oversized chunk still comes out whole.
        let (buffer, _flow) = OutputBuffer::new(small_config());
        buffer.push(chunk(500));
        let drained = buffer.drain(10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].len(), 500);
    }

    #[test]
    fn test_hard_cap_never_exceeded() {
        let (buffer, _flow) = OutputBuffer::new(small_config());
        let mut rng = rand::thread_rng();

        for _ in 0..10_000 {
            buffer.push(chunk(rng.gen_range(1..400)));
            assert!(buffer.len_bytes() <= 2000, "cap exceeded: {}", buffer.len_bytes());
        }
        assert!(buffer.dropped_chunks() > 0);
    }

    #[test]
    fn test_pause_emitted_once_at_high_watermark() {
        let (buffer, mut flow) = OutputBuffer::new(small_config());

        buffer.push(chunk(600));
        assert!(flow.try_recv().is_err());

        buffer.push(chunk(600));
        assert_eq!(flow.try_recv().unwrap(), FlowSignal::Pause);

        // Already paused: pushing more emits nothing.
        buffer.push(chunk(100));
        assert!(flow.try_recv().is_err());
    }

    #[test]
    fn test_resume_below_low_watermark() {
        let (buffer, mut flow) = OutputBuffer::new(small_config());

        buffer.push(chunk(600));
        buffer.push(chunk(600));
        assert_eq!(flow.try_recv().unwrap(), FlowSignal::Pause);

        // Drain one chunk: 600 left, still above low watermark.
        buffer.drain(600);
        assert!(flow.try_recv().is_err());

        // Drain the rest: below low watermark.
        buffer.drain(600);
        assert_eq!(flow.try_recv().unwrap(), FlowSignal::Resume);
    }

    #[test]
    fn test_hysteresis_alternates_under_random_load() {
        let (buffer, mut flow) = OutputBuffer::new(small_config());
        let mut rng = rand::thread_rng();

        for _ in 0..50_000 {
            if rng.gen_bool(0.55) {
                buffer.push(chunk(rng.gen_range(1..200)));
            } else {
                buffer.drain(rng.gen_range(1..400));
            }
        }
        // Drain fully to flush a trailing resume if paused.
        while !buffer.is_empty() {
            buffer.drain(usize::MAX);
        }

        let mut expected = FlowSignal::Pause;
        while let Ok(signal) = flow.try_recv() {
            assert_eq!(signal, expected, "pause/resume must alternate");
            expected = match expected {
                FlowSignal::Pause => FlowSignal::Resume,
                FlowSignal::Resume => FlowSignal::Pause,
            };
        }
    }

    #[tokio::test]
    async fn test_drain_waker_notified_on_push_and_attach() {
        let (buffer, _flow) = OutputBuffer::new(small_config());
        let notify = Arc::new(Notify::new());

        buffer.set_drain_waker(Some(notify.clone()));
        buffer.push(chunk(10));
        // Push must have notified.
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .expect("waker not notified on push");

        // Re-attach with backlog present must notify immediately.
        buffer.set_drain_waker(None);
        buffer.push(chunk(10));
        buffer.set_drain_waker(Some(notify.clone()));
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .expect("waker not notified on attach with backlog");
    }
}
