//! Local session host: a shell in a PTY driven by the operator's terminal.

pub mod pty;
pub mod tty;

pub use pty::{PtyShell, ShellCommand};
pub use tty::{RawModeGuard, SizeWatcher, detect_terminal_size, stdio_channel};
