use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::{Origin, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Client = 0,
    Injector = 1,
}

impl Priority {
    pub fn level(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    priority: Priority,
    payload: Bytes,
    origin: Origin,
}

impl PendingMessage {
    pub fn from_client(payload: Bytes) -> Self {
        Self {
            priority: Priority::Client,
            payload,
            origin: Origin::Client,
        }
    }

    pub fn from_injector(worker: WorkerId, payload: Bytes) -> Self {
        Self {
            priority: Priority::Injector,
            payload,
            origin: Origin::Injector(worker),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }
}

#[derive(Default)]
struct Tiers {
    client: VecDeque<PendingMessage>,
    injector: VecDeque<PendingMessage>,
}

impl Tiers {
    fn head(&self) -> Option<&PendingMessage> {
        self.client.front().or_else(|| self.injector.front())
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<PendingMessage> {
        match priority {
            Priority::Client => &mut self.client,
            Priority::Injector => &mut self.injector,
        }
    }
}

/// Two FIFO tiers behind one lock. The head is the oldest client message, or
/// the oldest injected message when no client message is pending.
#[derive(Default)]
pub struct ArbitrationQueue {
    tiers: Mutex<Tiers>,
}

impl ArbitrationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, message: PendingMessage) {
        let mut tiers = self.tiers.lock();
        tiers.tier_mut(message.priority).push_back(message);
    }

    pub fn len(&self) -> usize {
        let tiers = self.tiers.lock();
        tiers.client.len() + tiers.injector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.lock().head().is_none()
    }

    pub fn head_origin(&self) -> Option<Origin> {
        self.tiers.lock().head().map(|message| message.origin)
    }

    pub fn peek_is_ready(&self, clear: bool) -> bool {
        self.tiers
            .lock()
            .head()
            .is_some_and(|head| head.origin.is_client() || clear)
    }

    /// Pops the head only if it is eligible; a withheld head keeps its place.
    pub fn dequeue_if_ready(&self, clear: bool) -> Option<PendingMessage> {
        let mut tiers = self.tiers.lock();
        let head = tiers.head()?;
        if !head.origin.is_client() && !clear {
            return None;
        }
        let priority = head.priority;
        tiers.tier_mut(priority).pop_front()
    }
}

/// Enqueue-only view of the queue handed to injector workers.
#[derive(Clone)]
pub struct QueueHandle {
    queue: Arc<ArbitrationQueue>,
}

impl QueueHandle {
    pub fn new(queue: Arc<ArbitrationQueue>) -> Self {
        Self { queue }
    }

    pub fn submit(&self, worker: WorkerId, payload: Bytes) {
        self.queue
            .enqueue(PendingMessage::from_injector(worker, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn client(text: &'static str) -> PendingMessage {
        PendingMessage::from_client(Bytes::from_static(text.as_bytes()))
    }

    fn injected(id: u64, text: &'static str) -> PendingMessage {
        PendingMessage::from_injector(WorkerId(id), Bytes::from_static(text.as_bytes()))
    }

    fn drain(queue: &ArbitrationQueue) -> Vec<PendingMessage> {
        std::iter::from_fn(|| queue.dequeue_if_ready(true)).collect()
    }

    #[test]
    fn client_tier_drains_before_injected_tier() {
        let queue = ArbitrationQueue::new();
        queue.enqueue(injected(1, "whoami\r"));
        queue.enqueue(client("l"));
        queue.enqueue(injected(2, "id\r"));
        queue.enqueue(client("s"));

        let order: Vec<_> = drain(&queue)
            .into_iter()
            .map(|m| m.payload().clone())
            .collect();
        assert_eq!(
            order,
            vec![
                Bytes::from_static(b"l"),
                Bytes::from_static(b"s"),
                Bytes::from_static(b"whoami\r"),
                Bytes::from_static(b"id\r"),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn withheld_injected_head_keeps_its_place() {
        let queue = ArbitrationQueue::new();
        queue.enqueue(injected(1, "first\r"));
        queue.enqueue(injected(2, "second\r"));

        assert!(!queue.peek_is_ready(false));
        assert!(queue.dequeue_if_ready(false).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.head_origin(), Some(Origin::Injector(WorkerId(1))));

        let head = queue.dequeue_if_ready(true).unwrap();
        assert_eq!(head.payload().as_ref(), b"first\r");
        assert_eq!(head.priority(), Priority::Injector);
    }

    #[test]
    fn client_messages_pass_while_not_clear() {
        let queue = ArbitrationQueue::new();
        queue.enqueue(injected(1, "id\r"));
        queue.enqueue(client("ls\n"));

        assert!(queue.peek_is_ready(false));
        let sent = queue.dequeue_if_ready(false).unwrap();
        assert_eq!(sent.origin(), Origin::Client);
        assert_eq!(sent.priority().level(), 0);
        assert!(queue.dequeue_if_ready(false).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn empty_queue_is_never_ready() {
        let queue = ArbitrationQueue::new();
        assert!(!queue.peek_is_ready(true));
        assert!(queue.dequeue_if_ready(true).is_none());
        assert_eq!(queue.head_origin(), None);
    }

    #[test_timeout::timeout]
    fn concurrent_workers_keep_per_worker_fifo() {
        let queue = Arc::new(ArbitrationQueue::new());
        let handles: Vec<_> = (1..=4u64)
            .map(|id| {
                let handle = QueueHandle::new(Arc::clone(&queue));
                thread::spawn(move || {
                    for seq in 0..200u32 {
                        handle.submit(WorkerId(id), Bytes::from(seq.to_be_bytes().to_vec()));
                    }
                })
            })
            .collect();
        for seq in 0..50u32 {
            queue.enqueue(PendingMessage::from_client(Bytes::from(seq.to_be_bytes().to_vec())));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = drain(&queue);
        assert_eq!(drained.len(), 850);
        assert!(drained[..50].iter().all(|m| m.origin().is_client()));

        let mut last_seen = std::collections::HashMap::new();
        for message in &drained {
            let seq = u32::from_be_bytes(message.payload().as_ref().try_into().unwrap());
            if let Some(previous) = last_seen.insert(message.origin(), seq) {
                assert!(seq > previous, "{} out of order", message.origin());
            }
        }
    }
}
