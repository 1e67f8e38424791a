//! Console rendering of engine events
//!
//! Consumes the observer channel and draws upload progress with a byte bar
//! plus scrolling status lines. This is the default CLI view; any other
//! frontend can subscribe to the same channel instead.

use crate::events::{EventReceiver, SyncEvent};
use crate::print_job::PrintState;
use crate::session::ConnState;
use crate::transfer::TransferProgress;
use indicatif::{ProgressBar, ProgressStyle};

pub struct TransferBar {
    bar: Option<ProgressBar>,
}

impl TransferBar {
    pub fn new() -> Self {
        Self { bar: None }
    }

    pub fn update(&mut self, progress: &TransferProgress) {
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(progress.total_bytes);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:20!} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_message(progress.filename.clone());
            bar
        });
        bar.set_position(progress.bytes_sent);
        if progress.bytes_sent >= progress.total_bytes {
            bar.finish();
            self.bar = None;
        }
    }

    /// Abandon the bar (failed transfer) without printing a completion.
    pub fn abandon(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }

    /// Print a line above the live bar, cargo-style.
    pub fn println(&self, line: &str) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }
}

impl Default for TransferBar {
    fn default() -> Self {
        Self::new()
    }
}

/// Render events until the engine side closes the channel.
pub async fn render_events(mut rx: EventReceiver) {
    let mut bar = TransferBar::new();
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::Connection(state) => {
                let label = match state {
                    ConnState::Disconnected => "printer offline",
                    ConnState::Connecting => "connecting...",
                    ConnState::Connected => "printer online",
                };
                if state == ConnState::Disconnected {
                    bar.abandon();
                }
                bar.println(label);
            }
            SyncEvent::PrinterIdentified(info) => {
                bar.println(&format!("{} (firmware {})", info.name, info.version));
            }
            SyncEvent::PassStarted { ops, .. } => {
                if ops > 0 {
                    bar.println(&format!("reconciling: {ops} operation(s)"));
                }
            }
            SyncEvent::PassFinished {
                succeeded, failed, ..
            } => {
                if succeeded + failed > 0 {
                    bar.println(&format!("pass done: {succeeded} ok, {failed} failed"));
                }
            }
            SyncEvent::PassSkippedPrinting { .. } => {
                bar.println("printer busy printing, sync deferred");
            }
            SyncEvent::OpSucceeded { op, .. } => {
                bar.println(&format!("  {op}: done"));
            }
            SyncEvent::OpFailed { op, error, .. } => {
                bar.abandon();
                bar.println(&format!("  {op}: FAILED ({error})"));
            }
            SyncEvent::Transfer(progress) => bar.update(&progress),
            SyncEvent::Print(status) => {
                if status.is_active() {
                    let name = status.filename.as_deref().unwrap_or("(unnamed job)");
                    let state = match status.state {
                        PrintState::Paused => "paused",
                        _ => "printing",
                    };
                    bar.println(&format!(
                        "{state} {name}: {:.1}% ({}/{} bytes)",
                        status.percent(),
                        status.bytes_read,
                        status.total_bytes
                    ));
                } else {
                    bar.println("printer idle");
                }
            }
        }
    }
}
