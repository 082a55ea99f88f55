//! Per-transfer state machine (RFC 1350).
//!
//! One [`Session`] value drives one file transfer end to end, whichever side
//! of the protocol it sits on. The role decides which packets it originates:
//! a `Sender` reads the local file and emits DATA, a `Receiver` writes the
//! local file and emits ACK. The endpoint decides the two remaining
//! asymmetries: what goes on the wire first, and whether the first datagram
//! that comes back binds the peer's transfer ID (clients learn the server's
//! ephemeral port from it; a server session is born already bound).
//!
//! The protocol is strictly lock-step: at most one datagram is in flight,
//! and every send happens-before the next receive. The receive deadline is
//! the session's only suspension point.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::block::BlockNumber;
use crate::error::{ErrorCode, Result, TftpError};
use crate::netascii::{NetasciiReader, NetasciiWriter};
use crate::packet::{Mode, Packet};
use crate::{BLOCK_SIZE, MAX_DATAGRAM_SIZE};

/// Which packets this side originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reads the local file, sends DATA, consumes ACK.
    Sender,
    /// Writes the local file, consumes DATA, sends ACK.
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Client,
    Server,
}

/// Knobs shared by every session, fed from the CLI / config file.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Receive deadline per lock-step exchange.
    pub timeout: Duration,
    /// Bound on the timeout counter and on the duplicate-driven
    /// retransmit counter; each is tracked separately.
    pub max_attempts: u32,
    /// When off, ERROR packets leave with an empty message text.
    pub error_message_delivery: bool,
    /// When off, per-block log lines are suppressed.
    pub block_messages: bool,
    /// Byte string written for a netascii line break.
    pub line_ending: Vec<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            error_message_delivery: false,
            block_messages: true,
            line_ending: crate::HOST_LINE_ENDING.to_vec(),
        }
    }
}

/// What the session will do with the local filesystem once it runs. Opening
/// is deferred into the run so that every failure funnels through the one
/// top-level handler that reports to the peer.
enum TransferPlan {
    SendLocal {
        path: PathBuf,
    },
    ReceiveLocal {
        path: PathBuf,
        /// Server-side writes land in a temp file and rename into place;
        /// client downloads are created directly.
        staged: bool,
    },
}

enum SourceIo {
    Octet(File),
    Netascii(NetasciiReader<File>),
}

/// Block reader with the end-of-transfer bookkeeping: a zero-length file
/// still yields one empty DATA, and a file of exactly k*512 bytes yields an
/// extra empty DATA after the last full block.
struct BlockSource {
    io: SourceIo,
    has_read: bool,
    last_len: usize,
}

impl BlockSource {
    async fn next_block(&mut self) -> Result<Option<Vec<u8>>> {
        let chunk = match &mut self.io {
            SourceIo::Octet(file) => read_octet_block(file).await?,
            SourceIo::Netascii(reader) => reader.read_block(BLOCK_SIZE).await?,
        };
        Ok(match chunk {
            Some(payload) => {
                self.has_read = true;
                self.last_len = payload.len();
                Some(payload)
            }
            None => {
                if !self.has_read || self.last_len == BLOCK_SIZE {
                    // The terminating short block is an empty one.
                    self.has_read = true;
                    self.last_len = 0;
                    Some(Vec::new())
                } else {
                    None
                }
            }
        })
    }
}

enum SinkIo {
    Octet(File),
    Netascii(NetasciiWriter<File>),
}

struct BlockSink {
    io: SinkIo,
    /// `(temp, destination)` when the write is staged.
    staged: Option<(PathBuf, PathBuf)>,
}

enum Transfer {
    Send(BlockSource),
    Receive(BlockSink),
}

/// One transfer, one session, one ephemeral socket.
pub struct Session {
    socket: UdpSocket,
    /// Own transfer ID: the ephemeral port, used as the log prefix.
    tid: u16,
    endpoint: Endpoint,
    role: Role,
    /// Requested mode string; resolved against [`Mode`] at setup so that
    /// `mail` (and anything else unknown) is answered with an ERROR.
    mode_str: String,
    peer: SocketAddr,
    /// Once locked, datagrams from any other endpoint are rejected with
    /// ERROR(0) and do not touch session state.
    peer_locked: bool,
    /// Client request filename (RRQ/WRQ); unused on the server side.
    remote_name: Option<String>,
    plan: TransferPlan,
    transfer: Option<Transfer>,
    current_block: BlockNumber,
    /// Exact bytes of the last transmission; retransmission resends these.
    last_sent: Vec<u8>,
    retries: u32,
    timeouts: u32,
    complete: bool,
    config: SessionConfig,
    /// End-of-life flag read by the server dispatcher.
    active: Arc<AtomicBool>,
}

impl Session {
    /// Client download: RRQ, then receive DATA into `destination`.
    ///
    /// The caller has already checked that `destination` does not exist;
    /// creation here is exclusive regardless, so a race still fails closed.
    pub async fn client_get(
        server: SocketAddr,
        remote_name: &str,
        destination: &Path,
        mode: Mode,
        config: SessionConfig,
    ) -> Result<Session> {
        Self::new(
            Endpoint::Client,
            Role::Receiver,
            mode.as_str().to_string(),
            server,
            false,
            Some(remote_name.to_string()),
            TransferPlan::ReceiveLocal {
                path: destination.to_path_buf(),
                staged: false,
            },
            config,
            Arc::new(AtomicBool::new(true)),
        )
        .await
    }

    /// Client upload: WRQ, then send DATA out of `source`.
    pub async fn client_put(
        server: SocketAddr,
        source: &Path,
        remote_name: &str,
        mode: Mode,
        config: SessionConfig,
    ) -> Result<Session> {
        Self::new(
            Endpoint::Client,
            Role::Sender,
            mode.as_str().to_string(),
            server,
            false,
            Some(remote_name.to_string()),
            TransferPlan::SendLocal {
                path: source.to_path_buf(),
            },
            config,
            Arc::new(AtomicBool::new(true)),
        )
        .await
    }

    /// Server side of an accepted RRQ: serve `path` to `peer`.
    pub async fn server_read(
        peer: SocketAddr,
        path: PathBuf,
        mode_str: String,
        config: SessionConfig,
        active: Arc<AtomicBool>,
    ) -> Result<Session> {
        Self::new(
            Endpoint::Server,
            Role::Sender,
            mode_str,
            peer,
            true,
            None,
            TransferPlan::SendLocal { path },
            config,
            active,
        )
        .await
    }

    /// Server side of an accepted WRQ: receive into `path`.
    pub async fn server_write(
        peer: SocketAddr,
        path: PathBuf,
        mode_str: String,
        config: SessionConfig,
        active: Arc<AtomicBool>,
    ) -> Result<Session> {
        Self::new(
            Endpoint::Server,
            Role::Receiver,
            mode_str,
            peer,
            true,
            None,
            TransferPlan::ReceiveLocal { path, staged: true },
            config,
            active,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn new(
        endpoint: Endpoint,
        role: Role,
        mode_str: String,
        peer: SocketAddr,
        peer_locked: bool,
        remote_name: Option<String>,
        plan: TransferPlan,
        config: SessionConfig,
        active: Arc<AtomicBool>,
    ) -> Result<Session> {
        // RFC 1350: each transfer picks a fresh TID.
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let tid = socket.local_addr()?.port();
        Ok(Session {
            socket,
            tid,
            endpoint,
            role,
            mode_str,
            peer,
            peer_locked,
            remote_name,
            plan,
            transfer: None,
            current_block: BlockNumber::ZERO,
            last_sent: Vec::new(),
            retries: 0,
            timeouts: 0,
            complete: false,
            config,
            active,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Drive the transfer to completion or bounded failure.
    ///
    /// Every session error is caught exactly once here: an ERROR datagram
    /// carrying the taxonomy code is sent best-effort (peer-originated
    /// errors and exhausted budgets stay silent), resources are released,
    /// and the end-of-life flag drops.
    pub async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        match &result {
            Ok(()) => {
                info!("[{}] transfer complete ({} with {})", self.tid, self.describe(), self.peer);
            }
            Err(err) => {
                self.report_failure(err).await;
                self.discard_partial().await;
            }
        }
        // Dropping the session closes socket and file on every path; the
        // flag is the one datum another task reads.
        self.active.store(false, Ordering::Release);
        result
    }

    async fn drive(&mut self) -> Result<()> {
        self.open_transfer().await?;
        self.start().await?;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while !self.complete {
            match tokio::time::timeout(self.config.timeout, self.socket.recv_from(&mut buf)).await {
                Err(_) => self.on_timeout().await?,
                Ok(Ok((len, src))) => {
                    if self.peer_locked && src != self.peer {
                        self.reject_stranger(src).await;
                        continue;
                    }
                    if !self.peer_locked {
                        // First reply binds the peer's ephemeral TID.
                        self.peer = src;
                        self.peer_locked = true;
                        debug!("[{}] peer TID bound to {}", self.tid, src);
                    }
                    let packet = Packet::decode(&buf[..len])?;
                    self.dispatch(packet).await?;
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Resolve the mode and open the local side. Runs inside `drive` so a
    /// refused mode or a failed open is reported like any other failure.
    async fn open_transfer(&mut self) -> Result<()> {
        let mode = Mode::from_str(&self.mode_str)?;
        let transfer = match &self.plan {
            TransferPlan::SendLocal { path } => {
                let file = File::open(path).await.map_err(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        TftpError::FileNotFound(path.clone())
                    } else {
                        TftpError::Io(e)
                    }
                })?;
                let io = match mode {
                    Mode::Octet => SourceIo::Octet(file),
                    Mode::Netascii => SourceIo::Netascii(NetasciiReader::new(file)),
                };
                Transfer::Send(BlockSource {
                    io,
                    has_read: false,
                    last_len: 0,
                })
            }
            TransferPlan::ReceiveLocal { path, staged } => {
                let (open_path, landing) = if *staged {
                    // The destination must not pre-exist even though the
                    // bytes land in a temp file first.
                    if tokio::fs::try_exists(path).await? {
                        return Err(TftpError::FileExists(path.clone()));
                    }
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let temp = path.with_extension("tftp-partial");
                    (temp.clone(), Some((temp, path.clone())))
                } else {
                    (path.clone(), None)
                };
                let file = if landing.is_some() {
                    // A stale temp from an interrupted run is overwritten.
                    File::create(&open_path).await?
                } else {
                    OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&open_path)
                        .await
                        .map_err(|e| {
                            if e.kind() == io::ErrorKind::AlreadyExists {
                                TftpError::FileExists(path.clone())
                            } else {
                                TftpError::Io(e)
                            }
                        })?
                };
                let io = match mode {
                    Mode::Octet => SinkIo::Octet(file),
                    Mode::Netascii => {
                        SinkIo::Netascii(NetasciiWriter::new(file, &self.config.line_ending))
                    }
                };
                Transfer::Receive(BlockSink {
                    io,
                    staged: landing,
                })
            }
        };
        self.transfer = Some(transfer);
        Ok(())
    }

    /// The endpoint/role hook: what goes on the wire before the loop.
    async fn start(&mut self) -> Result<()> {
        match (self.endpoint, self.role) {
            (Endpoint::Client, Role::Receiver) => {
                let filename = self.remote_name.clone().unwrap_or_default();
                info!("[{}] requesting {} from {}", self.tid, filename, self.peer);
                self.send(Packet::Rrq {
                    filename,
                    mode: self.mode_str.clone(),
                })
                .await
            }
            (Endpoint::Client, Role::Sender) => {
                let filename = self.remote_name.clone().unwrap_or_default();
                info!("[{}] offering {} to {}", self.tid, filename, self.peer);
                self.send(Packet::Wrq {
                    filename,
                    mode: self.mode_str.clone(),
                })
                .await
            }
            // Accepted RRQ: the first DATA is the acceptance.
            (Endpoint::Server, Role::Sender) => self.advance_send().await,
            // Accepted WRQ: ACK 0 invites the first DATA.
            (Endpoint::Server, Role::Receiver) => {
                self.send(Packet::Ack {
                    block: BlockNumber::ZERO,
                })
                .await
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<()> {
        match (packet, self.role) {
            (Packet::Ack { block }, Role::Sender) => self.on_ack(block).await,
            (Packet::Data { block, payload }, Role::Receiver) => self.on_data(block, payload).await,
            (Packet::Error { code, message }, _) => {
                // Terminates the session; nothing is sent back.
                error!("[{}] peer reported error {}: {}", self.tid, code, message);
                Err(TftpError::Peer { code, message })
            }
            (other, _) => Err(TftpError::IllegalOperation(format!(
                "unexpected {:?} packet for this transfer",
                other.opcode()
            ))),
        }
    }

    /// ACK handling on the sending side.
    async fn on_ack(&mut self, block: BlockNumber) -> Result<()> {
        if block == self.current_block {
            if self.config.block_messages {
                debug!("[{}] ACK for block {}", self.tid, block);
            }
            self.retries = 0;
            self.timeouts = 0;
            self.advance_send().await
        } else if self.current_block.follows(block) {
            // The peer re-ACKed the previous block: our DATA went missing.
            self.bump_retries(format!("duplicate ACK for block {block}"))?;
            if self.config.block_messages {
                debug!(
                    "[{}] duplicate ACK for block {}, retransmitting block {}",
                    self.tid, block, self.current_block
                );
            }
            self.resend().await
        } else {
            Err(TftpError::IllegalOperation(format!(
                "ACK for block {} while at block {}",
                block, self.current_block
            )))
        }
    }

    /// Read the next block; either finish the transfer or put DATA on the
    /// wire. The block counter moves before the send.
    async fn advance_send(&mut self) -> Result<()> {
        let source = match self.transfer.as_mut() {
            Some(Transfer::Send(source)) => source,
            _ => return Err(TftpError::Tftp("no send transfer open".to_string())),
        };
        match source.next_block().await? {
            None => {
                self.complete = true;
                Ok(())
            }
            Some(payload) => {
                self.current_block = self.current_block.next();
                let len = payload.len();
                self.send(Packet::Data {
                    block: self.current_block,
                    payload,
                })
                .await?;
                if self.config.block_messages {
                    debug!(
                        "[{}] sent DATA block {} ({} bytes)",
                        self.tid, self.current_block, len
                    );
                }
                Ok(())
            }
        }
    }

    /// DATA handling on the receiving side.
    async fn on_data(&mut self, block: BlockNumber, payload: Vec<u8>) -> Result<()> {
        if block.follows(self.current_block) {
            self.write_payload(&payload).await?;
            self.current_block = self.current_block.next();
            self.retries = 0;
            self.timeouts = 0;
            self.send(Packet::Ack {
                block: self.current_block,
            })
            .await?;
            if self.config.block_messages {
                debug!(
                    "[{}] wrote DATA block {} ({} bytes)",
                    self.tid,
                    self.current_block,
                    payload.len()
                );
            }
            if payload.len() < BLOCK_SIZE {
                // Short block ends the transfer; no dallying after the ACK.
                self.finish_receive().await?;
                self.complete = true;
            }
            Ok(())
        } else if block == self.current_block {
            // Duplicate of what was already written: re-ACK, never re-write.
            self.bump_retries(format!("duplicate DATA block {block}"))?;
            if self.config.block_messages {
                debug!("[{}] duplicate DATA block {}, re-ACKing", self.tid, block);
            }
            self.resend().await
        } else {
            Err(TftpError::IllegalOperation(format!(
                "DATA block {} while at block {}",
                block, self.current_block
            )))
        }
    }

    async fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        match self.transfer.as_mut() {
            Some(Transfer::Receive(sink)) => {
                match &mut sink.io {
                    SinkIo::Octet(file) => file.write_all(payload).await?,
                    SinkIo::Netascii(writer) => writer.write_block(payload).await?,
                }
                Ok(())
            }
            _ => Err(TftpError::Tftp("no receive transfer open".to_string())),
        }
    }

    /// Flush the sink, close it, and move a staged file into place.
    async fn finish_receive(&mut self) -> Result<()> {
        let sink = match self.transfer.take() {
            Some(Transfer::Receive(sink)) => sink,
            _ => return Err(TftpError::Tftp("no receive transfer open".to_string())),
        };
        match sink.io {
            SinkIo::Octet(mut file) => file.flush().await?,
            SinkIo::Netascii(mut writer) => writer.finish().await?,
        }
        if let Some((temp, destination)) = sink.staged {
            tokio::fs::rename(&temp, &destination).await?;
        }
        Ok(())
    }

    /// Receive deadline expired: retransmit the last datagram until the
    /// budget runs out, then terminate without originating an ERROR.
    async fn on_timeout(&mut self) -> Result<()> {
        self.timeouts += 1;
        if self.timeouts > self.config.max_attempts.saturating_sub(1) {
            warn!(
                "[{}] no reply from {} after {} timeouts, giving up",
                self.tid, self.peer, self.timeouts
            );
            return Err(TftpError::RetriesExhausted {
                attempts: self.timeouts,
                context: "receive deadline expired".to_string(),
            });
        }
        debug!(
            "[{}] receive timeout, retransmitting (attempt {}/{})",
            self.tid, self.timeouts, self.config.max_attempts
        );
        self.resend().await
    }

    /// Duplicate-driven retransmits share the same bound as timeouts but
    /// are counted on their own.
    fn bump_retries(&mut self, context: String) -> Result<()> {
        self.retries += 1;
        if self.retries > self.config.max_attempts.saturating_sub(1) {
            return Err(TftpError::RetriesExhausted {
                attempts: self.retries,
                context,
            });
        }
        Ok(())
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        let wire = packet.encode()?;
        self.socket.send_to(&wire, self.peer).await?;
        self.last_sent = wire;
        Ok(())
    }

    /// Byte-identical retransmission of the last datagram.
    async fn resend(&mut self) -> Result<()> {
        if !self.last_sent.is_empty() {
            self.socket.send_to(&self.last_sent, self.peer).await?;
        }
        Ok(())
    }

    /// A datagram from the wrong endpoint: tell that endpoint, touch
    /// nothing else, keep waiting for the real peer.
    async fn reject_stranger(&self, src: SocketAddr) {
        warn!(
            "[{}] datagram from unexpected endpoint {} (peer is {})",
            self.tid, src, self.peer
        );
        let packet = Packet::Error {
            code: ErrorCode::NotDefined as u16,
            message: String::new(),
        };
        if let Ok(wire) = packet.encode()
            && let Err(e) = self.socket.send_to(&wire, src).await
        {
            debug!("[{}] could not reject {}: {}", self.tid, src, e);
        }
    }

    async fn report_failure(&mut self, err: &TftpError) {
        error!("[{}] session with {} failed: {}", self.tid, self.peer, err);
        if !err.reportable_to_peer() {
            return;
        }
        let message = if self.config.error_message_delivery {
            err.to_string()
        } else {
            String::new()
        };
        let code = err.wire_code() as u16;
        // A message that cannot be encoded (non-ASCII path) goes out empty.
        let wire = Packet::Error { code, message }.encode().or_else(|_| {
            Packet::Error {
                code,
                message: String::new(),
            }
            .encode()
        });
        match wire {
            Ok(wire) => {
                if let Err(e) = self.socket.send_to(&wire, self.peer).await {
                    warn!(
                        "[{}] could not deliver ERROR to {}: {}",
                        self.tid, self.peer, e
                    );
                }
            }
            Err(e) => warn!("[{}] could not build ERROR packet: {}", self.tid, e),
        }
    }

    /// Drop a half-written staged file after a failure.
    async fn discard_partial(&mut self) {
        if let Some(Transfer::Receive(sink)) = self.transfer.take() {
            let staged = sink.staged.clone();
            drop(sink);
            if let Some((temp, _)) = staged {
                if let Err(e) = tokio::fs::remove_file(&temp).await {
                    debug!("[{}] could not remove {}: {}", self.tid, temp.display(), e);
                }
            }
        }
    }

    fn describe(&self) -> &'static str {
        match (self.endpoint, self.role) {
            (Endpoint::Client, Role::Receiver) => "get",
            (Endpoint::Client, Role::Sender) => "put",
            (Endpoint::Server, Role::Sender) => "read served",
            (Endpoint::Server, Role::Receiver) => "write accepted",
        }
    }
}

/// Read up to one full block from an octet source. Short reads are looped
/// so a block is only short at EOF.
async fn read_octet_block(file: &mut File) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf))
}
