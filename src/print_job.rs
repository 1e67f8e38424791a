//! Print control and status polling
//!
//! Starts and stops prints and republishes the board's byte-based
//! progress. The board counts bytes read from storage, not layers, so the
//! percentage is known to be non-linear against wall-clock print time; it
//! is reproduced verbatim, never smoothed or reinterpreted.

use crate::error::{ProtocolError, SyncError};
use crate::events::{emit, EventSender, SyncEvent};
use crate::protocol::{self, Command, StatusReply};
use crate::session::SharedConnection;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintState {
    Idle,
    Printing,
    Paused,
    Error,
}

/// Status of the job in flight. Refreshed by polling while a print is
/// active, cleared once the board reports idle.
#[derive(Debug, Clone)]
pub struct PrintJobStatus {
    pub state: PrintState,
    pub bytes_read: u64,
    pub total_bytes: u64,
    /// Only known when this controller started the job; prints started at
    /// the panel have no name on the wire.
    pub filename: Option<String>,
}

impl PrintJobStatus {
    pub fn idle() -> Self {
        Self {
            state: PrintState::Idle,
            bytes_read: 0,
            total_bytes: 0,
            filename: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, PrintState::Printing | PrintState::Paused)
    }

    /// Byte-based completion percentage, exactly as the board reports it.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_read as f64 * 100.0 / self.total_bytes as f64
        }
    }

    pub fn from_reply(reply: StatusReply, filename: Option<String>) -> Self {
        match reply {
            StatusReply::Idle => PrintJobStatus::idle(),
            StatusReply::Printing {
                bytes_read,
                total_bytes,
            } => PrintJobStatus {
                state: PrintState::Printing,
                bytes_read,
                total_bytes,
                filename,
            },
            StatusReply::Paused {
                bytes_read,
                total_bytes,
            } => PrintJobStatus {
                state: PrintState::Paused,
                bytes_read,
                total_bytes,
                filename,
            },
        }
    }
}

pub struct PrintController {
    conn: SharedConnection,
    events: EventSender,
    poll_interval: Duration,
    /// Name of the job this controller last started, if any.
    current_job: Mutex<Option<String>>,
}

impl PrintController {
    pub fn new(conn: SharedConnection, events: EventSender, poll_interval: Duration) -> Self {
        Self {
            conn,
            events,
            poll_interval,
            current_job: Mutex::new(None),
        }
    }

    pub async fn start_print(&self, remote_name: &str) -> Result<(), SyncError> {
        let mut conn = self.conn.lock().await;
        let session = conn.ensure_connected().await?;
        let cmd = Command::StartPrint(remote_name.to_string());
        let reply = match session.exchange(&cmd).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.teardown("print start failed");
                return Err(e.into());
            }
        };
        if protocol::is_error_reply(&reply) {
            return Err(ProtocolError::Rejected {
                cmd: cmd.encode(),
                reply,
            }
            .into());
        }
        info!("print started: {remote_name}");
        *self.current_job.lock() = Some(remote_name.to_string());
        Ok(())
    }

    pub async fn stop_print(&self) -> Result<(), SyncError> {
        let mut conn = self.conn.lock().await;
        let session = conn.ensure_connected().await?;
        let cmd = Command::StopPrint;
        let reply = match session.exchange(&cmd).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.teardown("print stop failed");
                return Err(e.into());
            }
        };
        if protocol::is_error_reply(&reply) {
            return Err(ProtocolError::Rejected {
                cmd: cmd.encode(),
                reply,
            }
            .into());
        }
        info!("print stopped");
        *self.current_job.lock() = None;
        Ok(())
    }

    /// One status exchange. A malformed reply is a session-level failure,
    /// like every other framing error in this protocol.
    pub async fn poll_status(&self) -> Result<PrintJobStatus, SyncError> {
        let mut conn = self.conn.lock().await;
        let session = conn.ensure_connected().await?;
        let reply = match session.exchange(&Command::QueryStatus).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.teardown("status poll failed");
                return Err(e.into());
            }
        };
        let Some(parsed) = protocol::parse_status_reply(&reply) else {
            conn.teardown("unparseable status reply");
            return Err(ProtocolError::Malformed {
                cmd: Command::QueryStatus.encode(),
                line: reply,
            }
            .into());
        };
        drop(conn);

        if parsed == StatusReply::Idle {
            *self.current_job.lock() = None;
        }
        let status = PrintJobStatus::from_reply(parsed, self.current_job.lock().clone());
        emit(&self.events, SyncEvent::Print(status.clone()));
        Ok(status)
    }

    /// Poll on a short fixed cadence until the board reports idle or the
    /// connection drops. Each poll takes and releases the command gate, so
    /// reconciliation operations interleave between polls.
    pub async fn watch_job(&self) -> Result<PrintJobStatus, SyncError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let status = self.poll_status().await?;
            if !status.is_active() {
                debug!("print finished, polling stops");
                return Ok(status);
            }
        }
    }
}
