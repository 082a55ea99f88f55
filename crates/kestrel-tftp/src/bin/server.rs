// Kestrel TFTP server binary

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kestrel_tftp::config::{LogFormat, ServerConfig, load_config, validate_config, write_config};
use kestrel_tftp::error::{Result, TftpError};
use kestrel_tftp::server::TftpServer;

#[derive(Parser, Debug)]
#[command(name = "kestrel-tftp-server", about = "RFC 1350 TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/kestrel/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the welcome socket
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Welcome-socket port (overrides the port of the bind address)
    #[arg(long)]
    port: Option<u16>,

    /// Receive deadline per exchange, in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Retransmission budget for timeouts and duplicates
    #[arg(long)]
    attempts: Option<u32>,

    /// Put failure detail into outgoing ERROR packets
    #[arg(long)]
    enable_error_message_delivery: bool,

    /// Silence the per-block log lines
    #[arg(long)]
    disable_block_messages: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        ServerConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(port) = cli.port {
        config.bind_addr.set_port(port);
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_ms = timeout;
    }
    if let Some(attempts) = cli.attempts {
        config.max_attempts = attempts;
    }
    if cli.enable_error_message_delivery {
        config.error_message_delivery = true;
    }
    if cli.disable_block_messages {
        config.block_messages = false;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    // Logging init happens after config validation so a broken config is
    // still reported on a plain stderr.
    let _log_guard = if let Some(ref log_file) = config.logging.file {
        let dir = match log_file.parent() {
            Some(path) => path,
            None => std::path::Path::new("."),
        };
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TftpError::Tftp("logging.file must include a file name".to_string()))?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .with_writer(non_blocking)
                    .init();
            }
        }

        Some(guard)
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .init();
            }
        }

        None
    };

    let server = TftpServer::bind(config)?;
    server.serve().await
}
