use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{InjectorTransport, PendingTransport, SessionChannel, StreamChannel, TransportError};
use crate::hostkey::HostKey;

/// Plain TCP injector transport: every connection carries exactly one
/// channel and no handshake bytes are exchanged.
///
/// Authentication and encryption belong to whatever transport the host
/// plugs in instead; this one is meant for loopback use and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl InjectorTransport for TcpTransport {
    fn start_server(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        host_key: &HostKey,
    ) -> Result<Box<dyn PendingTransport>, TransportError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        debug!(
            target = "stowaway::transport",
            %remote,
            host_key = %host_key.fingerprint(),
            "plain tcp transport ready"
        );
        Ok(Box::new(TcpPending {
            stream: Some(stream),
            remote,
        }))
    }
}

struct TcpPending {
    stream: Option<TcpStream>,
    remote: SocketAddr,
}

impl PendingTransport for TcpPending {
    fn accept(
        &mut self,
        _timeout: Duration,
    ) -> Result<Option<Arc<dyn SessionChannel>>, TransportError> {
        let Some(stream) = self.stream.take() else {
            return Ok(None);
        };
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        let channel = StreamChannel::new(format!("injector-{}", self.remote), reader, stream)?
            .with_close_hook(move || {
                let _ = closer.shutdown(Shutdown::Both);
            });
        Ok(Some(Arc::new(channel)))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    #[test_timeout::timeout]
    fn yields_exactly_one_channel_per_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (stream, remote) = listener.accept().unwrap();

        let key = HostKey::generate();
        let mut pending = TcpTransport.start_server(stream, remote, &key).unwrap();
        let channel = pending
            .accept(Duration::from_millis(10))
            .unwrap()
            .expect("first accept yields the channel");
        assert!(pending.accept(Duration::from_millis(10)).unwrap().is_none());

        client.write_all(b"id\r").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !channel.recv_ready() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(channel.recv(1024).unwrap().as_ref(), b"id\r");

        channel.send_all(b"uid=0\r\n").unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"uid=0\r\n");

        channel.close();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
