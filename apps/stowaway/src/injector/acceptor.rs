use crossbeam_channel::Sender;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::registry::{LiveWorker, WorkerRegistry};
use super::worker::{InjectorWorker, WorkerSettings};
use crate::arbitration::{QueueHandle, next_worker_id};
use crate::hostkey::HostKey;
use crate::session::SessionLiveness;
use crate::transport::{InjectorTransport, PendingTransport, SessionChannel, TransportError};

/// Reported to the forwarder when the acceptor hits an error it cannot
/// recover from; the session is torn down in response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptorFault {
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AcceptorTiming {
    /// Upper bound on how long a closed session goes unnoticed.
    pub accept_poll: Duration,
    /// Wait per attempt for the peer to open its channel.
    pub channel_poll: Duration,
    pub channel_attempts: u32,
}

pub struct Acceptor {
    listener: TcpListener,
    transport: Arc<dyn InjectorTransport>,
    host_key: HostKey,
    liveness: SessionLiveness,
    registry: WorkerRegistry,
    queue: QueueHandle,
    settings: WorkerSettings,
    timing: AcceptorTiming,
    faults: Sender<AcceptorFault>,
}

impl Acceptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        transport: Arc<dyn InjectorTransport>,
        host_key: HostKey,
        liveness: SessionLiveness,
        registry: WorkerRegistry,
        queue: QueueHandle,
        settings: WorkerSettings,
        timing: AcceptorTiming,
        faults: Sender<AcceptorFault>,
    ) -> Self {
        Self {
            listener,
            transport,
            host_key,
            liveness,
            registry,
            queue,
            settings,
            timing,
            faults,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("injector-acceptor".into())
            .spawn(move || self.run())
    }

    pub fn run(self) {
        if let Err(err) = self.listener.set_nonblocking(true) {
            self.fail(format!("listener could not switch to polling: {err}"));
            return;
        }
        while !self.liveness.is_closed() {
            match self.listener.accept() {
                Ok((stream, remote)) => match self.admit(stream, remote) {
                    Ok(()) => {}
                    Err(err) if err.is_recoverable() => {
                        warn!(
                            target = "stowaway::acceptor",
                            %remote,
                            error = %err,
                            "injector handshake failed; dropping connection"
                        );
                    }
                    Err(err) => {
                        self.fail(format!("injector connection from {remote} failed: {err}"));
                        return;
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.registry.reap_finished();
                    thread::sleep(self.timing.accept_poll);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail(format!("injector listener failed: {err}"));
                    return;
                }
            }
        }
        debug!(target = "stowaway::acceptor", "session closed; acceptor exiting");
    }

    fn admit(&self, stream: TcpStream, remote: SocketAddr) -> Result<(), TransportError> {
        stream.set_nonblocking(false)?;
        let mut pending = self
            .transport
            .start_server(stream, remote, &self.host_key)?;
        let channel = match self.await_channel(pending.as_mut()) {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                pending.close();
                return Err(TransportError::Protocol(
                    "peer never opened a channel".into(),
                ));
            }
            Err(err) => {
                pending.close();
                return Err(err);
            }
        };

        let id = next_worker_id();
        self.registry.insert(LiveWorker {
            id,
            remote,
            channel: Arc::clone(&channel),
        });
        let worker = InjectorWorker::new(
            id,
            remote,
            Arc::clone(&channel),
            self.settings,
            self.queue.clone(),
            self.registry.clone(),
            self.liveness.clone(),
        );
        match worker.spawn() {
            Ok(handle) => self.registry.attach(id, handle),
            Err(err) => {
                self.registry.remove(id);
                channel.close();
                return Err(TransportError::Io(err));
            }
        }
        info!(
            target = "stowaway::acceptor",
            worker = %id,
            %remote,
            live = self.registry.len(),
            "injector connected"
        );
        Ok(())
    }

    fn await_channel(
        &self,
        pending: &mut dyn PendingTransport,
    ) -> Result<Option<Arc<dyn SessionChannel>>, TransportError> {
        for _ in 0..self.timing.channel_attempts {
            if self.liveness.is_closed() {
                return Ok(None);
            }
            if let Some(channel) = pending.accept(self.timing.channel_poll)? {
                return Ok(Some(channel));
            }
        }
        Ok(None)
    }

    fn fail(&self, reason: String) {
        error!(target = "stowaway::acceptor", %reason, "injector acceptor failed; closing session");
        let _ = self.faults.try_send(AcceptorFault { reason });
    }
}

/// Connect hint printed next to the listener address.
pub fn connect_command(addr: SocketAddr) -> String {
    format!("ssh -p {} {}", addr.port(), addr.ip())
}
