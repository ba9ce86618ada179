use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use stowaway::cli::Cli;
use stowaway::config::InjectorConfig;
use stowaway::error::CliError;
use stowaway::forwarder::{InjectableForwarder, pump};
use stowaway::server::{
    PtyShell, RawModeGuard, ShellCommand, SizeWatcher, detect_terminal_size, stdio_channel,
};
use stowaway::session::Session;
use stowaway::telemetry::logging;
use stowaway::transport::TcpTransport;

const IDLE_SLEEP: Duration = Duration::from_millis(5);

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).map_err(CliError::from)?;
    run(&cli)?;
    Ok(())
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let config = InjectorConfig::try_from(&cli.injector)?;
    let command = ShellCommand::from_argv(&cli.host_command()?)?;
    let (cols, rows) = detect_terminal_size();
    let (shell, server) = PtyShell::spawn(&command, cols, rows)?;
    let session = Session::new(Arc::new(stdio_channel()?), Arc::new(server));
    let mut forwarder = InjectableForwarder::start(session, &config, Arc::new(TcpTransport))?;

    eprintln!(
        "stowaway: injector shell on {} (connect with: {})",
        forwarder.local_addr(),
        forwarder.connect_command()
    );

    let outcome = {
        let _raw = RawModeGuard::enable();
        drive(&mut forwarder, &shell, (cols, rows))
    };
    let report = forwarder.close_session();
    shell.shutdown();
    info!(
        target = "stowaway::forwarder",
        workers = report.workers_joined,
        reaped = report.workers_reaped,
        acceptor = report.acceptor_joined,
        listener_closed = report.listener_closed,
        "stowaway exiting"
    );
    outcome
}

fn drive(
    forwarder: &mut InjectableForwarder,
    shell: &PtyShell,
    size: (u16, u16),
) -> Result<(), CliError> {
    let mut sizes = SizeWatcher::new(size);
    loop {
        let session = forwarder.session();
        if session.is_closed() || session.server().is_closed() {
            return Ok(());
        }
        let moved = pump(forwarder)?;
        if let Some((cols, rows)) = sizes.poll() {
            if let Err(err) = shell.resize(cols, rows) {
                warn!(target = "stowaway::server", error = %err, "failed to resize shell");
            }
        }
        if !moved {
            thread::sleep(IDLE_SLEEP);
        }
    }
}
