use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{Level, trace};

use super::{ChannelError, SessionChannel};
use crate::telemetry::logging as logctl;

const READ_CHUNK: usize = 4096;

type CloseHook = Box<dyn Fn() + Send + Sync>;

/// Adapts a blocking reader/writer pair into a [`SessionChannel`].
///
/// A detached reader thread pulls chunks off the reader so that `recv_ready`
/// never blocks. End of stream and read errors both count as the remote
/// hanging up.
pub struct StreamChannel {
    label: String,
    inbound: Receiver<Bytes>,
    leftover: Mutex<Option<Bytes>>,
    writer: Mutex<Box<dyn Write + Send>>,
    eof: Arc<AtomicBool>,
    closed: AtomicBool,
    on_close: Option<CloseHook>,
}

impl StreamChannel {
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        let eof = Arc::new(AtomicBool::new(false));
        spawn_reader(label.clone(), reader, tx, Arc::clone(&eof))?;
        Ok(Self {
            label,
            inbound: rx,
            leftover: Mutex::new(None),
            writer: Mutex::new(Box::new(writer)),
            eof,
            closed: AtomicBool::new(false),
            on_close: None,
        })
    }

    /// Runs `hook` the first time the channel is closed.
    pub fn with_close_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn has_pending(&self) -> bool {
        self.leftover.lock().is_some() || !self.inbound.is_empty()
    }
}

fn spawn_reader<R>(
    label: String,
    mut reader: R,
    tx: Sender<Bytes>,
    eof: Arc<AtomicBool>,
) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{label}-reader"))
        .spawn(move || {
            let mut buffer = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        trace!(target = "stowaway::transport", channel = %label, error = %err, "reader stopped");
                        break;
                    }
                }
            }
            eof.store(true, Ordering::SeqCst);
        })?;
    Ok(())
}

impl SessionChannel for StreamChannel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || (self.eof.load(Ordering::SeqCst) && !self.has_pending())
    }

    fn recv_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.has_pending()
    }

    fn recv(&self, max: usize) -> Result<Bytes, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut leftover = self.leftover.lock();
        let mut chunk = match leftover.take() {
            Some(chunk) => chunk,
            None => match self.inbound.try_recv() {
                Ok(chunk) => chunk,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(Bytes::new()),
            },
        };
        if chunk.len() > max {
            let rest = chunk.split_off(max);
            *leftover = Some(rest);
        }
        if tracing::enabled!(Level::TRACE) {
            trace!(
                target = "stowaway::transport",
                channel = %self.label,
                bytes = chunk.len(),
                dump = %logctl::hexdump(&chunk),
                "recv"
            );
        }
        Ok(chunk)
    }

    fn send_all(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut writer = self.writer.lock();
        let result = writer.write_all(bytes).and_then(|_| writer.flush());
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Err(ChannelError::Closed),
            Err(err) => Err(ChannelError::Io(err)),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = &self.on_close {
            hook();
        }
        trace!(target = "stowaway::transport", channel = %self.label, "channel closed");
    }
}
