//! Server dispatcher.
//!
//! The dispatcher owns the welcome socket and nothing else: it accepts
//! initial RRQ/WRQ datagrams, screens them, and spawns one session task per
//! transfer. All further traffic for a transfer runs between the two
//! ephemeral TIDs; the welcome socket only ever sees first contacts.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::MAX_DATAGRAM_SIZE;
use crate::config::{ServerConfig, SocketConfig, WriteConfig};
use crate::error::{ErrorCode, Result, TftpError};
use crate::packet::Packet;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// Dispatcher-side view of a running session: the peer it is bound to and
/// the flag its task lowers at end-of-life. The flag is the only datum
/// shared across the task boundary.
struct SessionHandle {
    peer: SocketAddr,
    active: Arc<AtomicBool>,
}

pub struct TftpServer {
    config: Arc<ServerConfig>,
    socket: UdpSocket,
}

impl TftpServer {
    /// Bind the welcome socket. Serving is separate so callers can learn
    /// the bound address first.
    pub fn bind(config: ServerConfig) -> Result<TftpServer> {
        let socket = create_welcome_socket(config.bind_addr, &config.socket)?;
        Ok(TftpServer {
            config: Arc::new(config),
            socket,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Accept loop. Runs until the process is torn down; individual
    /// sessions never propagate failures up to here.
    pub async fn serve(&self) -> Result<()> {
        info!(
            "TFTP server listening on {}, serving {}",
            self.local_addr()?,
            self.config.root_dir.display()
        );

        let mut sessions: Vec<SessionHandle> = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("error receiving on welcome socket: {}", e);
                    continue;
                }
            };

            // Finished sessions are collected lazily, on the next arrival.
            sessions.retain(|handle| handle.active.load(Ordering::Acquire));

            // A second request from an endpoint whose transfer is still
            // running is a TID clash, answered on the welcome socket.
            if sessions.iter().any(|handle| handle.peer == src) {
                warn!("TID clash: {} already has an active transfer", src);
                self.send_welcome_error(src, ErrorCode::NotDefined, "")
                    .await;
                continue;
            }

            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("undecodable datagram from {}: {}", src, e);
                    self.send_welcome_error(src, e.wire_code(), &e.to_string())
                        .await;
                    continue;
                }
            };

            match packet {
                Packet::Rrq { filename, mode } => {
                    self.accept(src, filename, mode, Direction::Read, &mut sessions)
                        .await;
                }
                Packet::Wrq { filename, mode } => {
                    self.accept(src, filename, mode, Direction::Write, &mut sessions)
                        .await;
                }
                other => {
                    warn!(
                        "unexpected {:?} on welcome socket from {}",
                        other.opcode(),
                        src
                    );
                    self.send_welcome_error(src, ErrorCode::IllegalOperation, "illegal operation")
                        .await;
                }
            }
        }
    }

    async fn accept(
        &self,
        src: SocketAddr,
        filename: String,
        mode: String,
        direction: Direction,
        sessions: &mut Vec<SessionHandle>,
    ) {
        info!(
            "{} request from {}: {} ({})",
            match direction {
                Direction::Read => "read",
                Direction::Write => "write",
            },
            src,
            filename,
            mode
        );

        let path = match resolve_request_path(&self.config.root_dir, &filename) {
            Ok(path) => path,
            Err(e) => {
                warn!("rejected filename '{}' from {}: {}", filename, src, e);
                self.send_welcome_error(src, ErrorCode::AccessViolation, &e.to_string())
                    .await;
                return;
            }
        };

        if direction == Direction::Write {
            if !self.config.write.enabled {
                warn!("write request from {} but writes are disabled", src);
                self.send_welcome_error(src, ErrorCode::AccessViolation, "writes not permitted")
                    .await;
                return;
            }
            if !is_write_allowed(&path, &self.config.root_dir, &self.config.write) {
                warn!("write of '{}' from {} not in allowed patterns", filename, src);
                self.send_welcome_error(
                    src,
                    ErrorCode::AccessViolation,
                    "file not allowed for writing",
                )
                .await;
                return;
            }
        }

        let active = Arc::new(AtomicBool::new(true));
        sessions.push(SessionHandle {
            peer: src,
            active: active.clone(),
        });

        let session_config = self.config.session_config();
        tokio::spawn(async move {
            let session = match direction {
                Direction::Read => {
                    Session::server_read(src, path, mode, session_config, active.clone()).await
                }
                Direction::Write => {
                    Session::server_write(src, path, mode, session_config, active.clone()).await
                }
            };
            match session {
                Ok(session) => {
                    // run() reports, cleans up, and lowers the flag itself.
                    let _ = session.run().await;
                }
                Err(e) => {
                    error!("could not set up session for {}: {}", src, e);
                    active.store(false, Ordering::Release);
                }
            }
        });
    }

    async fn send_welcome_error(&self, dest: SocketAddr, code: ErrorCode, message: &str) {
        let message = if self.config.error_message_delivery {
            message.to_string()
        } else {
            String::new()
        };
        let code = code as u16;
        let wire = Packet::Error { code, message }.encode().or_else(|_| {
            Packet::Error {
                code,
                message: String::new(),
            }
            .encode()
        });
        match wire {
            Ok(wire) => {
                if let Err(e) = self.socket.send_to(&wire, dest).await {
                    warn!("could not send ERROR to {}: {}", dest, e);
                }
            }
            Err(e) => warn!("could not build ERROR packet: {}", e),
        }
        debug!("sent ERROR({}) to {} on welcome socket", code, dest);
    }
}

/// Welcome socket with platform tuning: SO_REUSEADDR for fast restarts and
/// sized buffers so request bursts are not dropped. Buffer sizing is
/// best-effort; the kernel may clamp it.
fn create_welcome_socket(bind_addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TftpError::Tftp(format!("failed to create socket: {e}")))?;

    if config.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|e| TftpError::Tftp(format!("failed to set SO_REUSEADDR: {e}")))?;
    }

    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_kb * 1024) {
        warn!(
            "failed to set SO_RCVBUF to {} KB: {}",
            config.recv_buffer_kb, e
        );
    }
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_kb * 1024) {
        warn!(
            "failed to set SO_SNDBUF to {} KB: {}",
            config.send_buffer_kb, e
        );
    }

    socket
        .bind(&bind_addr.into())
        .map_err(|e| TftpError::Tftp(format!("failed to bind to {bind_addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TftpError::Tftp(format!("failed to set non-blocking: {e}")))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| TftpError::Tftp(format!("failed to convert to tokio socket: {e}")))
}

/// Resolve a requested filename to a path under the root directory.
///
/// The wire filename is reduced to its plain name segments first: both `/`
/// and `\` separate, leading and doubled separators collapse, and a `..`
/// segment (or a name that reduces to nothing) refuses the request outright.
/// The resolved path is therefore a literal extension of the root; the one
/// escape hatch left is a symlink inside the tree, so every path step below
/// the root is checked for one. Steps that do not exist yet are fine — a
/// write is about to create them.
fn resolve_request_path(root_dir: &Path, filename: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in filename.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(TftpError::AccessViolation(format!(
                    "refusing filename '{filename}'"
                )));
            }
            name => relative.push(name),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(TftpError::AccessViolation("empty filename".to_string()));
    }

    let target = root_dir.join(&relative);
    for step in target.ancestors() {
        if step == root_dir {
            break;
        }
        match std::fs::symlink_metadata(step) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(TftpError::AccessViolation(
                    "symlinks are not allowed".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => {
                return Err(TftpError::AccessViolation("access denied".to_string()));
            }
        }
    }

    Ok(target)
}

/// Match a write target against the configured glob patterns, relative to
/// the root directory. No matching pattern means no write: enabling writes
/// without configuring any patterns admits nothing.
fn is_write_allowed(file_path: &Path, root_dir: &Path, write_config: &WriteConfig) -> bool {
    let relative_path = match file_path.strip_prefix(root_dir) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let path_str = match relative_path.to_str() {
        Some(s) => s,
        None => return false,
    };

    write_config.allowed_patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(path_str))
            .unwrap_or(false)
    })
}
