// Kestrel TFTP client binary

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use kestrel_tftp::client;
use kestrel_tftp::error::{Result, TftpError};
use kestrel_tftp::packet::Mode;
use kestrel_tftp::session::SessionConfig;
use kestrel_tftp::{DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT, DEFAULT_TIMEOUT_MS, HOST_LINE_ENDING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Command {
    /// Download: <source> is the remote name, <destination> the local path
    Get,
    /// Upload: <source> is the local path, <destination> the remote name
    Put,
}

/// Kestrel TFTP client
#[derive(Parser, Debug)]
#[command(name = "kestrel-tftp-client", about = "RFC 1350 TFTP client", long_about = None)]
struct Cli {
    /// TFTP server host name or address
    host: String,

    /// Transfer direction
    #[arg(value_enum)]
    command: Command,

    /// Remote name (get) or local path (put)
    source: String,

    /// Local path (get) or remote name (put)
    destination: String,

    /// Server port for the initial request
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Transfer mode (octet or netascii)
    #[arg(long, default_value = "octet")]
    mode: String,

    /// Receive deadline per exchange, in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout: u64,

    /// Retransmission budget for timeouts and duplicates
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    attempts: u32,

    /// Put failure detail into outgoing ERROR packets
    #[arg(long)]
    enable_error_message_delivery: bool,

    /// Silence the per-block log lines
    #[arg(long)]
    disable_block_messages: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    // `mail` and anything else unknown is fatal before any socket opens.
    let mode = Mode::from_str(&cli.mode)?;

    let server: SocketAddr = (cli.host.as_str(), cli.port)
        .to_socket_addrs()
        .map_err(|e| TftpError::Tftp(format!("cannot resolve {}: {}", cli.host, e)))?
        .next()
        .ok_or_else(|| TftpError::Tftp(format!("no address found for {}", cli.host)))?;

    let config = SessionConfig {
        timeout: Duration::from_millis(cli.timeout),
        max_attempts: cli.attempts,
        error_message_delivery: cli.enable_error_message_delivery,
        block_messages: !cli.disable_block_messages,
        line_ending: HOST_LINE_ENDING.to_vec(),
    };

    match cli.command {
        Command::Get => {
            let destination = PathBuf::from(&cli.destination);
            client::get(server, &cli.source, &destination, mode, config).await
        }
        Command::Put => {
            let source = PathBuf::from(&cli.source);
            client::put(server, &source, &cli.destination, mode, config).await
        }
    }
}
