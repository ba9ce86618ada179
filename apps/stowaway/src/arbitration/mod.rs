//! Arbitration between the legitimate client and injected input.
//!
//! Both producers feed an [`ArbitrationQueue`]; the forwarder owns the
//! [`SenderState`] that decides when the head of that queue may be written to
//! the shared server channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod queue;
pub mod sender;

pub use queue::{ArbitrationQueue, PendingMessage, Priority, QueueHandle};
pub use sender::{IDLE_PROBE, MarkerScanner, Observation, SenderState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "injector-{}", self.0)
    }
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_worker_id() -> WorkerId {
    WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Who produced a message, and therefore who receives the server output
/// that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Client,
    Injector(WorkerId),
}

impl Origin {
    pub fn is_client(self) -> bool {
        matches!(self, Origin::Client)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Client => f.write_str("client"),
            Origin::Injector(id) => id.fmt(f),
        }
    }
}
