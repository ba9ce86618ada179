use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::injector::acceptor::AcceptorTiming;
use crate::injector::{InputMode, WorkerSettings};

pub const DEFAULT_BUF_LEN: usize = 1024;
pub const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(500);
pub const DEFAULT_WORKER_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_CHANNEL_ATTEMPTS: u32 = 20;

/// Everything the forwarder needs to serve injector connections.
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Interface the injector listener binds to; the port is always ephemeral.
    pub bind_addr: IpAddr,
    /// Relay output meant for the legitimate client to attached injectors.
    pub mirror: bool,
    /// Line-buffered injector input with local echo.
    pub super_stealth: bool,
    /// Operator host key; a fresh one is generated per session when unset.
    pub host_key: Option<PathBuf>,
    pub buf_len: usize,
    pub accept_poll: Duration,
    pub channel_poll: Duration,
    pub channel_attempts: u32,
    pub worker_poll: Duration,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mirror: false,
            super_stealth: false,
            host_key: None,
            buf_len: DEFAULT_BUF_LEN,
            accept_poll: DEFAULT_ACCEPT_POLL,
            channel_poll: DEFAULT_ACCEPT_POLL,
            channel_attempts: DEFAULT_CHANNEL_ATTEMPTS,
            worker_poll: DEFAULT_WORKER_POLL,
        }
    }
}

impl InjectorConfig {
    pub fn input_mode(&self) -> InputMode {
        if self.super_stealth {
            InputMode::Buffered
        } else {
            InputMode::Immediate
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            mode: self.input_mode(),
            buf_len: self.buf_len,
            poll_interval: self.worker_poll,
        }
    }

    pub fn acceptor_timing(&self) -> AcceptorTiming {
        AcceptorTiming {
            accept_poll: self.accept_poll,
            channel_poll: self.channel_poll,
            channel_attempts: self.channel_attempts,
        }
    }
}
