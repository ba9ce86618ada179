use bytes::Bytes;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::hostkey::HostKey;

pub mod mock;
pub mod stream;
pub mod tcp;

pub use stream::StreamChannel;
pub use tcp::TcpTransport;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel io error: {0}")]
    Io(#[from] io::Error),
    #[error("channel protocol error: {0}")]
    Protocol(String),
}

/// Full-duplex byte channel owned by the hosting transport.
///
/// Every method is non-blocking except `send_all`, which returns once the
/// transport has taken the whole buffer.
pub trait SessionChannel: Send + Sync {
    fn is_closed(&self) -> bool;

    fn recv_ready(&self) -> bool;

    /// Reads at most `max` bytes. Returns an empty buffer when nothing is pending.
    fn recv(&self, max: usize) -> Result<Bytes, ChannelError>;

    fn send_all(&self, bytes: &[u8]) -> Result<(), ChannelError>;

    /// The remote side reported an exit status or hung up.
    fn exit_status_ready(&self) -> bool {
        self.is_closed()
    }

    /// Tears down the underlying transport, not just this byte stream. Idempotent.
    fn close(&self);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection reset during handshake")]
    Reset,
    #[error("peer closed the connection during handshake")]
    Eof,
    #[error("transport protocol error: {0}")]
    Protocol(String),
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Errors that only spoil the connection being set up.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Reset | TransportError::Eof | TransportError::Protocol(_) => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            ),
        }
    }
}

/// Server side of the injector-facing transport handshake.
pub trait InjectorTransport: Send + Sync {
    fn start_server(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        host_key: &HostKey,
    ) -> Result<Box<dyn PendingTransport>, TransportError>;
}

/// A handshaken connection that has not opened its logical channel yet.
pub trait PendingTransport: Send {
    /// Waits up to `timeout` for the peer's channel. `Ok(None)` means try again.
    fn accept(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn SessionChannel>>, TransportError>;

    fn close(&mut self);
}
