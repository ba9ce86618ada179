use clap::{ArgAction, Args, Parser, builder::BoolishValueParser};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::InjectorConfig;
use crate::error::CliError;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "stowaway",
    about = "Host a shell whose session accepts hidden injector connections",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub injector: InjectorArgs,

    #[arg(
        long,
        value_name = "PROGRAM",
        env = "STOWAWAY_SHELL",
        help = "Override the shell launched for hosting (defaults to $SHELL)"
    )]
    pub shell: Option<String>,

    #[arg(
        trailing_var_arg = true,
        value_name = "COMMAND",
        help = "Command to run instead of the shell"
    )]
    pub command: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "STOWAWAY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "STOWAWAY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct InjectorArgs {
    #[arg(
        long = "injector-net",
        value_name = "ADDR",
        env = "STOWAWAY_INJECTOR_NET",
        default_value = "127.0.0.1",
        help = "Local address/interface where injector sessions are served"
    )]
    pub net: String,

    #[arg(
        long = "enable-mirror",
        env = "STOWAWAY_ENABLE_MIRROR",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Mirror the host session's output to every injector shell"
    )]
    pub mirror: bool,

    #[arg(
        long = "super-stealth",
        env = "STOWAWAY_SUPER_STEALTH",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Buffer injected input per line and only send it while the shell is idle"
    )]
    pub super_stealth: bool,

    #[arg(
        long = "host-key",
        value_name = "PATH",
        env = "STOWAWAY_HOST_KEY",
        help = "Host key presented to injectors (a fresh key is generated when omitted)"
    )]
    pub host_key: Option<PathBuf>,
}

impl TryFrom<&InjectorArgs> for InjectorConfig {
    type Error = CliError;

    fn try_from(args: &InjectorArgs) -> Result<Self, Self::Error> {
        let bind_addr: IpAddr = args
            .net
            .trim()
            .parse()
            .map_err(|_| CliError::InvalidArgument(format!("invalid injector address '{}'", args.net)))?;
        Ok(InjectorConfig {
            bind_addr,
            mirror: args.mirror,
            super_stealth: args.super_stealth,
            host_key: args.host_key.clone(),
            ..InjectorConfig::default()
        })
    }
}

impl Cli {
    /// Program and arguments to host, falling back to `$SHELL`.
    pub fn host_command(&self) -> Result<Vec<String>, CliError> {
        if !self.command.is_empty() {
            return Ok(self.command.clone());
        }
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|shell| !shell.trim().is_empty())
            .map(|shell| vec![shell])
            .ok_or(CliError::MissingCommand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::InputMode;

    #[test]
    fn flags_map_onto_injector_config() {
        let cli = Cli::try_parse_from([
            "stowaway",
            "--injector-net",
            "0.0.0.0",
            "--enable-mirror",
            "--super-stealth",
            "--host-key",
            "/tmp/key",
            "--",
            "bash",
            "-l",
        ])
        .unwrap();
        let config = InjectorConfig::try_from(&cli.injector).unwrap();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0");
        assert!(config.mirror);
        assert_eq!(config.input_mode(), InputMode::Buffered);
        assert_eq!(config.host_key, Some(PathBuf::from("/tmp/key")));
        assert_eq!(cli.host_command().unwrap(), vec!["bash", "-l"]);
    }

    #[test]
    fn defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["stowaway", "--shell", "sh"]).unwrap();
        let config = InjectorConfig::try_from(&cli.injector).unwrap();
        assert!(!config.mirror);
        assert!(!config.super_stealth);
        assert_eq!(config.bind_addr, InjectorConfig::default().bind_addr);
        assert_eq!(cli.logging.to_config().level, LogLevel::Warn);
        assert_eq!(cli.host_command().unwrap(), vec!["sh"]);
    }

    #[test]
    fn rejects_unparseable_bind_address() {
        let cli = Cli::try_parse_from(["stowaway", "--injector-net", "not-an-ip"]).unwrap();
        let err = InjectorConfig::try_from(&cli.injector).unwrap_err();
        assert!(matches!(err, CliError::InvalidArgument(_)));
    }
}
