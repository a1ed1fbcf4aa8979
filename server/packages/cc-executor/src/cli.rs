use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ServerConfig, DEFAULT_PORT};
use crate::{run_server, ServerError};

#[derive(Parser, Debug)]
#[command(name = "cc-executor", bin_name = "cc-executor")]
#[command(about = "Run shell commands behind a WebSocket and stream their output", version)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the WebSocket executor server.
    Server(ServerArgs),
    /// Print the JSON schema of every protocol message.
    Schema,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, short = 'p', env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base command names accepted by `execute`. Accepts everything when unset.
    #[arg(long = "allowed-command", env = "ALLOWED_COMMANDS", value_delimiter = ',')]
    allowed_commands: Vec<String>,

    #[arg(long, env = "MAX_SESSIONS", default_value_t = 100)]
    max_sessions: usize,

    /// Seconds a session may go without requests before it is reaped.
    #[arg(long, env = "SESSION_TIMEOUT", default_value_t = 3600)]
    session_timeout: u64,

    /// Largest output chunk in bytes; longer lines are split.
    #[arg(long, env = "MAX_BUFFER_SIZE", default_value_t = 8 * 1024 * 1024)]
    max_buffer_size: usize,

    /// Seconds without output before a process counts as stalled (0 disables).
    #[arg(long, env = "STREAM_TIMEOUT", default_value_t = 600)]
    stream_timeout: u64,

    /// Report stalls without cancelling the process.
    #[arg(long, env = "NO_CANCEL_ON_STALL")]
    no_cancel_on_stall: bool,

    #[arg(long, env = "WEBSOCKET_HEARTBEAT_INTERVAL", default_value_t = 20)]
    heartbeat_interval: u64,

    /// Defaults to twice the heartbeat interval.
    #[arg(long, env = "WEBSOCKET_HEARTBEAT_TIMEOUT")]
    heartbeat_timeout: Option<u64>,

    #[arg(long, env = "RECONNECT_GRACE", default_value_t = 60)]
    reconnect_grace: u64,

    #[arg(long, env = "MAX_PENDING_MESSAGES", default_value_t = 10_000)]
    max_pending_messages: usize,

    /// Seconds between SIGTERM and SIGKILL when cancelling.
    #[arg(long, env = "PROCESS_CLEANUP_TIMEOUT", default_value_t = 10)]
    process_cleanup_timeout: u64,

    #[arg(long, env = "CC_EXECUTOR_SHELL", default_value = "/bin/sh")]
    shell: PathBuf,

    #[arg(long, env = "CC_EXECUTOR_WORKING_DIR")]
    working_dir: Option<PathBuf>,
}

impl ServerArgs {
    pub fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        let allowed_commands: Vec<String> = self
            .allowed_commands
            .into_iter()
            .map(|command| command.trim().to_string())
            .filter(|command| !command.is_empty())
            .collect();
        let heartbeat_interval = Duration::from_secs(self.heartbeat_interval);

        ServerConfig {
            host: self.host,
            port: self.port,
            allowed_commands: (!allowed_commands.is_empty()).then_some(allowed_commands),
            max_sessions: self.max_sessions,
            session_idle_timeout: Duration::from_secs(self.session_timeout),
            max_line_size: self.max_buffer_size,
            stream_timeout: (self.stream_timeout > 0).then(|| Duration::from_secs(self.stream_timeout)),
            cancel_on_stall: !self.no_cancel_on_stall,
            heartbeat_interval,
            heartbeat_timeout: self
                .heartbeat_timeout
                .map(Duration::from_secs)
                .unwrap_or(heartbeat_interval * 2),
            reconnect_grace: Duration::from_secs(self.reconnect_grace),
            max_pending_messages: self.max_pending_messages,
            termination_grace: Duration::from_secs(self.process_cleanup_timeout),
            shell: self.shell,
            working_dir: self.working_dir,
            ..defaults
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(#[from] ServerError),
}

pub fn run_cc_executor() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging();
    run_command(cli.command)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => serve_blocking(args.into_config()),
        Command::Schema => print_schema(),
    }
}

fn serve_blocking(config: ServerConfig) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_server(config))?;
    Ok(())
}

fn print_schema() -> Result<(), CliError> {
    let schema = cc_executor_protocol::protocol_schema()?;
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &schema)?;
    writeln!(stdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["cc-executor"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("valid arguments").command
    }

    #[test]
    fn server_flags_map_onto_the_config() {
        let Command::Server(args) = parse(&[
            "server",
            "--port",
            "9000",
            "--allowed-command",
            "echo, python3,,",
            "--stream-timeout",
            "0",
            "--heartbeat-interval",
            "5",
            "--process-cleanup-timeout",
            "3",
            "--no-cancel-on-stall",
        ]) else {
            panic!("expected server command");
        };
        let config = args.into_config();
        assert_eq!(config.port, 9000);
        assert_eq!(
            config.allowed_commands,
            Some(vec!["echo".to_string(), "python3".to_string()])
        );
        assert_eq!(config.stream_timeout, None);
        assert!(!config.cancel_on_stall);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.termination_grace, Duration::from_secs(3));
        assert_eq!(config.drain_timeout, ServerConfig::default().drain_timeout);
        config.validate().expect("valid");
    }

    #[test]
    fn schema_takes_no_arguments() {
        assert!(matches!(parse(&["schema"]), Command::Schema));
    }
}
