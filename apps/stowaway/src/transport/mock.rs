use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{ChannelError, SessionChannel};

/// In-memory channel for tests: inbound chunks are queued by the test and
/// everything sent through the channel is recorded.
#[derive(Default)]
pub struct MockChannel {
    inbound: Mutex<VecDeque<Bytes>>,
    sent: Mutex<Vec<Bytes>>,
    eof: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_inbound(&self, bytes: impl Into<Bytes>) {
        self.inbound.lock().push_back(bytes.into());
    }

    /// Marks the remote side as gone once the queued input is drained.
    pub fn hang_up(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent.lock().iter().flat_map(|b| b.iter().copied()).collect()
    }

    pub fn take_sent(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl SessionChannel for MockChannel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || (self.eof.load(Ordering::SeqCst) && self.inbound.lock().is_empty())
    }

    fn recv_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.inbound.lock().is_empty()
    }

    fn recv(&self, max: usize) -> Result<Bytes, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut inbound = self.inbound.lock();
        let Some(mut chunk) = inbound.pop_front() else {
            return Ok(Bytes::new());
        };
        if chunk.len() > max {
            inbound.push_front(chunk.split_off(max));
        }
        Ok(chunk)
    }

    fn send_all(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().push(Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}
