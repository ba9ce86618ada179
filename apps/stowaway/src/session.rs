use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::transport::SessionChannel;

/// The legitimate client's channel paired with the server channel it drives.
#[derive(Clone)]
pub struct Session {
    client: Arc<dyn SessionChannel>,
    server: Arc<dyn SessionChannel>,
    running: Arc<AtomicBool>,
}

impl Session {
    pub fn new(client: Arc<dyn SessionChannel>, server: Arc<dyn SessionChannel>) -> Self {
        Self {
            client,
            server,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn client(&self) -> &Arc<dyn SessionChannel> {
        &self.client
    }

    pub fn server(&self) -> &Arc<dyn SessionChannel> {
        &self.server
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_running() || self.client.is_closed()
    }

    pub fn liveness(&self) -> SessionLiveness {
        SessionLiveness {
            client: Arc::clone(&self.client),
            running: Arc::clone(&self.running),
        }
    }

    /// Closes the legitimate client's channel, which cancels every worker and
    /// the acceptor.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.client.close();
    }
}

/// Read-only view of session liveness for threads that must stop with it.
#[derive(Clone)]
pub struct SessionLiveness {
    client: Arc<dyn SessionChannel>,
    running: Arc<AtomicBool>,
}

impl SessionLiveness {
    pub fn is_closed(&self) -> bool {
        !self.running.load(Ordering::SeqCst) || self.client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockChannel;

    #[test]
    fn closing_the_session_is_visible_through_liveness() {
        let client = MockChannel::new();
        let server = MockChannel::new();
        let session = Session::new(client.clone(), server.clone());
        let liveness = session.liveness();
        assert!(!liveness.is_closed());

        session.close();
        assert!(liveness.is_closed());
        assert!(!session.is_running());
        assert_eq!(client.close_calls(), 1);
        assert_eq!(server.close_calls(), 0);
    }

    #[test]
    fn client_hangup_closes_the_session() {
        let client = MockChannel::new();
        let session = Session::new(client.clone(), MockChannel::new());
        client.hang_up();
        assert!(session.is_closed());
        assert!(session.liveness().is_closed());
    }
}
