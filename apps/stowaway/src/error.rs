use crate::forwarder::ForwardError;
use crate::telemetry::logging::InitError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Forward(#[from] ForwardError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("no executable command available; set $SHELL or pass '-- command'")]
    MissingCommand,
    #[error("failed to launch shell: {0}")]
    Spawn(String),
    #[error("terminal runtime error: {0}")]
    Runtime(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
