use parking_lot::Mutex;
use portable_pty::{Child, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use std::sync::Arc;
use tracing::debug;

use crate::error::CliError;
use crate::transport::StreamChannel;

#[derive(Clone, Debug)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    /// First element is the program, the rest its arguments.
    pub fn from_argv(argv: &[String]) -> Result<Self, CliError> {
        let (program, args) = argv.split_first().ok_or(CliError::MissingCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: vec![("TERM".into(), "xterm-256color".into())],
        })
    }
}

/// The hosted shell: the server side of the arbitrated session.
pub struct PtyShell {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
}

impl PtyShell {
    pub fn spawn(command: &ShellCommand, cols: u16, rows: u16) -> Result<(Self, StreamChannel), CliError> {
        let mut pair = open_pair(cols, rows)?;
        let child = spawn_child(&mut pair, command)?;
        let master = pair.master;
        let reader = master
            .try_clone_reader()
            .map_err(|err| CliError::Spawn(format!("clone PTY reader: {err}")))?;
        let writer = master
            .take_writer()
            .map_err(|err| CliError::Spawn(format!("take PTY writer: {err}")))?;
        let channel = StreamChannel::new("pty", reader, writer)?;
        debug!(
            target = "stowaway::server",
            program = %command.program,
            cols,
            rows,
            "shell spawned"
        );
        Ok((
            Self {
                master: Arc::new(Mutex::new(master)),
                child: Arc::new(Mutex::new(Some(child))),
            },
            channel,
        ))
    }

    pub fn has_exited(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), CliError> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .lock()
            .resize(size)
            .map_err(|err| CliError::Runtime(format!("resize PTY: {err}")))
    }

    pub fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_pair(cols: u16, rows: u16) -> Result<PtyPair, CliError> {
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    native_pty_system()
        .openpty(size)
        .map_err(|err| CliError::Spawn(format!("open PTY pair: {err}")))
}

fn spawn_child(pair: &mut PtyPair, command: &ShellCommand) -> Result<Box<dyn Child + Send + Sync>, CliError> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    pair.slave
        .spawn_command(cmd)
        .map_err(|err| CliError::Spawn(format!("{}: {err}", command.program)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SessionChannel;
    use std::time::{Duration, Instant};

    #[test]
    fn argv_splits_program_from_arguments() {
        let command = ShellCommand::from_argv(&["sh".into(), "-c".into(), "true".into()]).unwrap();
        assert_eq!(command.program, "sh");
        assert_eq!(command.args, vec!["-c", "true"]);
        assert!(matches!(
            ShellCommand::from_argv(&[]),
            Err(CliError::MissingCommand)
        ));
    }

    #[cfg(unix)]
    #[test_timeout::timeout]
    fn shell_output_arrives_on_the_channel() {
        let command =
            ShellCommand::from_argv(&["sh".into(), "-c".into(), "printf stowaway-ready".into()])
                .unwrap();
        let (shell, channel) = PtyShell::spawn(&command, 80, 24).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("stowaway-ready") {
            assert!(Instant::now() < deadline, "no output from shell");
            if channel.recv_ready() {
                seen.extend_from_slice(&channel.recv(1024).unwrap());
            } else {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        shell.shutdown();
        assert!(shell.has_exited());
    }
}
