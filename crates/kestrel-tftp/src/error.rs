use std::path::PathBuf;

use thiserror::Error;

/// TFTP error codes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileAlreadyExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

#[derive(Error, Debug)]
pub enum TftpError {
    /// A received datagram that does not parse as any RFC 1350 packet.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A packet that cannot be built within the wire-format limits
    /// (oversized DATA payload, oversized datagram, non-ASCII string).
    #[error("illegal packet build: {0}")]
    IllegalBuild(String),

    /// A syntactically valid packet that the session state machine cannot
    /// accept in its current state (wrong opcode for the role, block number
    /// out of sequence).
    #[error("illegal TFTP operation: {0}")]
    IllegalOperation(String),

    /// Transfer mode string the session refuses. `mail` lands here.
    #[error("unsupported transfer mode: {0}")]
    UnsupportedMode(String),

    #[error("file already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Filename refused by the server's root-directory containment checks.
    #[error("access violation: {0}")]
    AccessViolation(String),

    /// The peer sent an ERROR packet; the session terminates silently.
    #[error("peer error {code}: {message}")]
    Peer { code: u16, message: String },

    /// Timeout or duplicate budget exhausted. Terminates the session
    /// without originating an ERROR datagram.
    #[error("transfer aborted after {attempts} attempts: {context}")]
    RetriesExhausted { attempts: u32, context: String },

    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TftpError {
    /// Wire error code used when this failure is reported to the peer.
    /// Everything without a dedicated RFC code collapses to 0.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            TftpError::FileExists(_) => ErrorCode::FileAlreadyExists,
            TftpError::FileNotFound(_) => ErrorCode::FileNotFound,
            TftpError::AccessViolation(_) => ErrorCode::AccessViolation,
            TftpError::IllegalOperation(_) => ErrorCode::IllegalOperation,
            _ => ErrorCode::NotDefined,
        }
    }

    /// Whether the session's top-level handler should transmit an ERROR
    /// for this failure. Peer-originated errors and exhausted budgets
    /// terminate without sending anything.
    pub fn reportable_to_peer(&self) -> bool {
        !matches!(
            self,
            TftpError::Peer { .. } | TftpError::RetriesExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
