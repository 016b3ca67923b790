//! In-process [`DataChannel`] pair with a faithful send-buffer model.
//!
//! `buffered_amount` grows as the local side sends and shrinks as the remote
//! side drains, so backpressure behaves like a real data channel: a sender
//! that outpaces the reader sees its buffer climb, and the low-watermark
//! event fires only once the reader has caught up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use super::{ChannelError, DataChannel};

/// One direction of the pair. The sender owns the counters; the reader on
/// the far end decrements them and fires the low event.
struct Pipe {
    queue: Mutex<VecDeque<Bytes>>,
    buffered: AtomicUsize,
    low_watermark: AtomicUsize,
    low_notify: Notify,
    data_notify: Notify,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            buffered: AtomicUsize::new(0),
            low_watermark: AtomicUsize::new(0),
            low_notify: Notify::new(),
            data_notify: Notify::new(),
        })
    }
}

pub struct MemoryChannel {
    outgoing: Arc<Pipe>,
    incoming: Arc<Pipe>,
    closed: Arc<AtomicBool>,
}

/// Build a connected pair. Each endpoint's outgoing pipe is the other's
/// incoming pipe; closing either endpoint closes both directions.
pub fn channel_pair() -> (MemoryChannel, MemoryChannel) {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryChannel {
            outgoing: a_to_b.clone(),
            incoming: b_to_a.clone(),
            closed: closed.clone(),
        },
        MemoryChannel {
            outgoing: b_to_a,
            incoming: a_to_b,
            closed,
        },
    )
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.outgoing
            .buffered
            .fetch_add(payload.len(), Ordering::SeqCst);
        self.outgoing.queue.lock().await.push_back(payload);
        self.outgoing.data_notify.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Option<Bytes> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let wakeup = self.incoming.data_notify.notified();
            if let Some(payload) = self.incoming.queue.lock().await.pop_front() {
                let remaining = self
                    .incoming
                    .buffered
                    .fetch_sub(payload.len(), Ordering::SeqCst)
                    - payload.len();
                if remaining <= self.incoming.low_watermark.load(Ordering::SeqCst) {
                    self.incoming.low_notify.notify_waiters();
                }
                return Some(payload);
            }
            wakeup.await;
        }
    }

    fn buffered_amount(&self) -> usize {
        self.outgoing.buffered.load(Ordering::SeqCst)
    }

    fn set_low_watermark(&self, threshold: usize) {
        self.outgoing.low_watermark.store(threshold, Ordering::SeqCst);
    }

    async fn wait_buffered_low(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let wakeup = self.outgoing.low_notify.notified();
            let occupancy = self.outgoing.buffered.load(Ordering::SeqCst);
            if occupancy <= self.outgoing.low_watermark.load(Ordering::SeqCst) {
                return;
            }
            wakeup.await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Wake anything parked on either direction so it observes the close.
        self.outgoing.data_notify.notify_waiters();
        self.incoming.data_notify.notify_waiters();
        self.outgoing.low_notify.notify_waiters();
        self.incoming.low_notify.notify_waiters();
    }
}
