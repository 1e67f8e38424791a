//! Error taxonomy for the sync engine
//!
//! Socket- and protocol-level failures are never fatal to the process: they
//! force a session teardown and the ping timer retries. Per-file failures
//! only fail their own plan entry and are re-evaluated on the next pass.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// No response arrived within the bounded wait for one exchange.
/// Treated identically to a socket error: the session is torn down.
#[derive(Debug, Error)]
#[error("no response within {}ms ({context})", limit.as_millis())]
pub struct Timeout {
    pub context: &'static str,
    pub limit: Duration,
}

/// Establishing a session failed. Triggers backoff via the ping timer.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("printer {addr} unreachable: {source}")]
    Unreachable {
        addr: String,
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {}ms", limit.as_millis())]
    Timeout { addr: String, limit: Duration },
    #[error("handshake failed: {0}")]
    Handshake(#[source] ProtocolError),
}

/// The live session produced something the line protocol cannot recover
/// from. Always escalates to a full session reset.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed reply to {cmd}: {line:?}")]
    Malformed { cmd: String, line: String },
    #[error("board rejected {cmd}: {reply}")]
    Rejected { cmd: String, reply: String },
    #[error("connection closed by printer")]
    Closed,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Timeout(#[from] Timeout),
}

impl ProtocolError {
    /// A `Rejected` is a well-formed refusal and leaves the session
    /// healthy; everything else here means the framing is gone.
    pub fn is_connection_loss(&self) -> bool {
        !matches!(self, ProtocolError::Rejected { .. })
    }
}

/// A chunked upload failed. Aborts the current upload only; the file is
/// retried from byte 0 on the next reconciliation pass.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("board refused write of {name}: {reply}")]
    Refused { name: String, reply: String },
    #[error("chunk {chunk} at offset {offset} not acknowledged: {reply:?}")]
    ChunkNack {
        chunk: u64,
        offset: u64,
        reply: String,
    },
    #[error("size verification of {name} failed: {reply}")]
    SizeVerify { name: String, reply: String },
    #[error("{name} kept changing on disk, upload deferred")]
    Unstable { name: String },
    #[error("{name} is {size} bytes, past what the 32-bit chunk offset can address")]
    TooLarge { name: String, size: u64 },
    #[error("cannot read local file {name}: {source}")]
    LocalRead {
        name: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransferError {
    /// Whether this failure also invalidates the session (socket loss or
    /// framing corruption) rather than just the one file.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, TransferError::Protocol(p) if p.is_connection_loss())
    }
}

/// Invalid configuration. Surfaced immediately; blocks pipeline start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sync folder {0:?} does not exist or is not a directory")]
    BadFolder(PathBuf),
    #[error("printer host is not set")]
    EmptyHost,
    #[error("ping interval must be at least one minute")]
    BadPingInterval,
    #[error("cannot read config {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path:?}: {source}")]
    Unparsable {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("cannot watch {path:?}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

/// Top-level error for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Failures that force the connection manager back to `Disconnected`.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            SyncError::Protocol(p) => p.is_connection_loss(),
            SyncError::Transfer(t) => t.is_connection_loss(),
            _ => false,
        }
    }
}
