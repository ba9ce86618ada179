use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size as terminal_size};
use std::io;
use tracing::warn;

use crate::transport::StreamChannel;

const MIN_SIZE: (u16, u16) = (20, 10);
const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Holds the operator's terminal in raw mode; restores it on drop. A
/// terminal that refuses raw mode is left cooked.
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    pub fn enable() -> Self {
        let active = enable_raw_mode()
            .inspect_err(|err| {
                warn!(target = "stowaway::server", error = %err, "terminal stays in cooked mode");
            })
            .is_ok();
        Self { active }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = disable_raw_mode() {
                warn!(target = "stowaway::server", error = %err, "could not restore terminal mode");
            }
        }
    }
}

fn env_dimension(names: &[&str]) -> Option<u16> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok()?.trim().parse().ok())
}

/// Size of the operator's terminal, falling back to `COLUMNS`/`LINES` when
/// stdout is not a tty.
pub fn detect_terminal_size() -> (u16, u16) {
    let (cols, rows) = match terminal_size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => (
            env_dimension(&["COLUMNS"]).unwrap_or(FALLBACK_SIZE.0),
            env_dimension(&["LINES", "ROWS"]).unwrap_or(FALLBACK_SIZE.1),
        ),
    };
    (cols.max(MIN_SIZE.0), rows.max(MIN_SIZE.1))
}

/// The operator's own terminal as the legitimate client channel.
pub fn stdio_channel() -> io::Result<StreamChannel> {
    StreamChannel::new("stdio", io::stdin(), io::stdout())
}

/// Polls the local terminal size and reports changes.
#[derive(Debug)]
pub struct SizeWatcher {
    last: (u16, u16),
}

impl SizeWatcher {
    pub fn new(initial: (u16, u16)) -> Self {
        Self { last: initial }
    }

    pub fn poll(&mut self) -> Option<(u16, u16)> {
        self.observe(detect_terminal_size())
    }

    fn observe(&mut self, current: (u16, u16)) -> Option<(u16, u16)> {
        if current == self.last {
            return None;
        }
        self.last = current;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_watcher_reports_only_changes() {
        let mut watcher = SizeWatcher::new((80, 24));
        assert_eq!(watcher.observe((80, 24)), None);
        assert_eq!(watcher.observe((120, 40)), Some((120, 40)));
        assert_eq!(watcher.observe((120, 40)), None);
    }

    #[test]
    fn detected_size_respects_minimums() {
        let (cols, rows) = detect_terminal_size();
        assert!(cols >= MIN_SIZE.0);
        assert!(rows >= MIN_SIZE.1);
    }
}
