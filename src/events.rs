//! Observer interface
//!
//! The core never talks to a UI directly; it emits `SyncEvent`s over a
//! channel and whoever owns the receiving end (CLI, tray app, logger)
//! renders them. Dropping the receiver silently discards events, which is
//! exactly what one-shot commands want.

use crate::mirror::PlanOp;
use crate::print_job::PrintJobStatus;
use crate::protocol::PrinterInfo;
use crate::session::ConnState;
use crate::transfer::TransferProgress;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection manager state transition.
    Connection(ConnState),
    /// Identity learned from the connect-time handshake.
    PrinterIdentified(PrinterInfo),
    /// A reconciliation pass computed its plan and is starting to apply it.
    PassStarted { pass_id: Uuid, ops: usize },
    /// The pass ran to the end (individual operations may have failed).
    PassFinished {
        pass_id: Uuid,
        succeeded: usize,
        failed: usize,
    },
    /// A pass was skipped because the board is busy printing.
    PassSkippedPrinting { pass_id: Uuid },
    /// One plan operation completed.
    OpSucceeded { pass_id: Uuid, op: PlanOp },
    /// One plan operation failed; the pass continues with the next entry.
    OpFailed {
        pass_id: Uuid,
        op: PlanOp,
        error: String,
    },
    /// Per-chunk upload progress.
    Transfer(TransferProgress),
    /// Print job status poll result.
    Print(PrintJobStatus),
}

pub type EventSender = mpsc::UnboundedSender<SyncEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Fire-and-forget emit; observers are optional.
pub fn emit(tx: &EventSender, event: SyncEvent) {
    let _ = tx.send(event);
}
