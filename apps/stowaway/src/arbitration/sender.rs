use bytes::Bytes;

use super::Origin;

/// Probe written to the server to provoke a fresh prompt.
pub const IDLE_PROBE: &[u8] = b"\r";

/// Finds the idle marker in a stream of server output chunks, including a
/// marker that arrives split across two reads.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    marker: Bytes,
    tail: Vec<u8>,
}

impl MarkerScanner {
    /// `None` for an empty marker, which would match everything.
    pub fn new(marker: Bytes) -> Option<Self> {
        if marker.is_empty() {
            return None;
        }
        Some(Self {
            marker,
            tail: Vec::new(),
        })
    }

    pub fn marker(&self) -> &Bytes {
        &self.marker
    }

    pub fn scan(&mut self, chunk: &[u8]) -> bool {
        let mut window = Vec::with_capacity(self.tail.len() + chunk.len());
        window.extend_from_slice(&self.tail);
        window.extend_from_slice(chunk);

        let found = window
            .windows(self.marker.len())
            .any(|candidate| candidate == self.marker.as_ref());

        let keep = self.marker.len() - 1;
        let start = window.len().saturating_sub(keep);
        self.tail = window.split_off(start);
        found
    }
}

/// What the forwarder should do with a chunk of server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Reply to the idle probe; swallowed. `learned` is false when the reply
    /// trimmed down to nothing and the probe has to be repeated.
    ProbeReply { learned: bool },
    Forward,
}

/// Ownership of the server channel and the inferred idle state. Owned and
/// mutated by the forwarder alone.
#[derive(Debug, Clone)]
pub struct SenderState {
    current_sender: Origin,
    probing: bool,
    clear_signal: Option<MarkerScanner>,
    clear: bool,
}

impl Default for SenderState {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderState {
    pub fn new() -> Self {
        Self {
            current_sender: Origin::Client,
            probing: false,
            clear_signal: None,
            clear: true,
        }
    }

    pub fn current_sender(&self) -> Origin {
        self.current_sender
    }

    pub fn is_clear(&self) -> bool {
        self.clear
    }

    pub fn clear_signal(&self) -> Option<&Bytes> {
        self.clear_signal.as_ref().map(MarkerScanner::marker)
    }

    pub fn needs_probe(&self) -> bool {
        self.clear_signal.is_none()
    }

    pub fn is_probing(&self) -> bool {
        self.probing
    }

    pub fn client_activity(&mut self) {
        self.clear = false;
    }

    pub fn begin_probe(&mut self) {
        self.probing = true;
    }

    /// Drops an outstanding probe; its reply is then treated as ordinary output.
    pub fn abandon_probe(&mut self) {
        self.probing = false;
    }

    pub fn record_send(&mut self, origin: Origin) {
        self.current_sender = origin;
    }

    pub fn observe_server_output(&mut self, chunk: &[u8]) -> Observation {
        if self.probing {
            self.probing = false;
            self.current_sender = Origin::Client;
            let marker = Bytes::copy_from_slice(chunk.trim_ascii());
            self.clear_signal = MarkerScanner::new(marker);
            return Observation::ProbeReply {
                learned: self.clear_signal.is_some(),
            };
        }
        if let Some(scanner) = self.clear_signal.as_mut() {
            if scanner.scan(chunk) {
                self.clear = true;
            }
        }
        Observation::Forward
    }
}
