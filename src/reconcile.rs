//! Reconciliation loop
//!
//! The single worker that turns filesystem deltas into ordered protocol
//! operations. It merges debounced folder-change notifications with
//! periodic full mirror passes and executes the resulting plan one
//! operation at a time through the command gate. Timers:
//!
//! - ping interval: reconnect attempts while disconnected, liveness ping
//!   while connected
//! - mirror interval: full pass cadence while connected
//! - status poll: short cadence while the board is printing, stopped on
//!   idle or disconnect
//!
//! A per-file failure is reported and skipped; a socket/protocol failure
//! tears the session down and everything is re-derived on the next pass.
//! Reconfiguration means building a new `Pipeline`; no state crosses over.

use crate::config::SyncConfig;
use crate::error::{ConfigError, ProtocolError, SyncError, TransferError};
use crate::events::{emit, EventSender, SyncEvent};
use crate::metadata::MetadataStore;
use crate::mirror::{self, PlanOp, PlanOptions};
use crate::oplog::OpLog;
use crate::print_job::PrintController;
use crate::protocol::{self, Command, StatusReply};
use crate::session::{shared, Connection, SharedConnection};
use crate::transfer;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Quiet window after the last folder event before a pass runs. A slicer
/// writing a file in bursts collapses to one pending reconciliation.
const DEBOUNCE: Duration = Duration::from_millis(750);

/// A file must hold its size this long before it is considered fully
/// written and safe to upload.
const STABLE_WINDOW: Duration = Duration::from_secs(1);
const STABLE_CHECK: Duration = Duration::from_millis(100);
const STABLE_DEADLINE: Duration = Duration::from_secs(60);

pub struct Pipeline {
    config: SyncConfig,
    conn: SharedConnection,
    events: EventSender,
    meta: MetadataStore,
    oplog: Option<OpLog>,
    plan_opts: PlanOptions,
    controller: Arc<PrintController>,
    /// Short-cadence status poller, alive only while a print is active.
    poll_task: Option<JoinHandle<()>>,
}

/// Outcome of the pre-pass connect-and-status check.
enum PassGate {
    Ready,
    Printing,
    Unavailable,
}

impl Pipeline {
    /// Build a pipeline from validated configuration. Invalid config is
    /// rejected here, before anything starts.
    pub fn new(config: SyncConfig, events: EventSender) -> Result<Self, ConfigError> {
        config.validate()?;
        let conn = shared(Connection::new(config.endpoint(), events.clone()));
        let meta = MetadataStore::load(&config.metadata_path());
        let oplog = config.op_log.as_deref().map(OpLog::new);
        let plan_opts = PlanOptions {
            remote_delete: config.remote_delete,
        };
        let controller = Arc::new(PrintController::new(
            conn.clone(),
            events.clone(),
            config.status_poll_interval(),
        ));
        Ok(Self {
            config,
            conn,
            events,
            meta,
            oplog,
            plan_opts,
            controller,
            poll_task: None,
        })
    }

    /// Shared handle to the command gate, for print control alongside the
    /// running loop.
    pub fn connection(&self) -> SharedConnection {
        self.conn.clone()
    }

    /// Drive reconciliation until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<String>();
        let _watcher = spawn_watcher(&self.config.sync_folder, fs_tx)?;

        let ping_every = self.config.endpoint().ping_interval;
        let mut ping = interval(ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mirror_every = self.config.mirror_interval();
        let mut mirror_tick = interval_at(Instant::now() + mirror_every, mirror_every);
        mirror_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending: HashSet<String> = HashSet::new();
        let mut debounce_at: Option<Instant> = None;

        info!(
            "watching {} for {}",
            self.config.sync_folder.display(),
            self.config.printer_host
        );

        loop {
            let deadline = debounce_at;
            let debounce = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }
                Some(name) = fs_rx.recv() => {
                    debug!("folder change: {name}");
                    pending.insert(name);
                    debounce_at = Some(Instant::now() + DEBOUNCE);
                }
                _ = debounce => {
                    debounce_at = None;
                    let names = std::mem::take(&mut pending);
                    if self.conn.lock().await.is_connected() {
                        debug!("change burst settled ({} file(s))", names.len());
                        self.run_pass().await;
                    }
                    // While offline the pending changes are implied by the
                    // full pass that follows reconnection.
                }
                _ = ping.tick() => {
                    if self.conn.lock().await.is_connected() {
                        self.liveness_ping().await;
                    } else {
                        // Reconnect attempt; never faster than the ping
                        // interval so an offline printer is not flooded.
                        self.run_pass().await;
                    }
                }
                _ = mirror_tick.tick() => {
                    if self.conn.lock().await.is_connected() {
                        self.run_pass().await;
                    }
                }
            }
        }
        let _ = self.meta.save();
        Ok(())
    }

    /// One full mirror pass: connect if needed, check the board is not
    /// printing, snapshot both sides, diff, apply. All failures are
    /// absorbed here; the timers decide when to try again.
    pub async fn run_pass(&mut self) {
        let pass_id = Uuid::new_v4();

        match self.check_gate(pass_id).await {
            PassGate::Ready => {}
            PassGate::Printing => {
                self.ensure_status_poll();
                return;
            }
            PassGate::Unavailable => return,
        }

        let local = match mirror::scan_local(&self.config.sync_folder) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("cannot scan {}: {e}", self.config.sync_folder.display());
                return;
            }
        };

        // Same-size edits are invisible to the remote listing; the
        // metadata cache flags them by content hash.
        let mut modified = HashSet::new();
        for name in local.files.keys() {
            let path = self.config.sync_folder.join(name);
            match self.meta.is_modified(name, &path) {
                Ok(true) => {
                    modified.insert(name.clone());
                }
                Ok(false) => {}
                Err(e) => debug!("skipping modification check for {name}: {e}"),
            }
        }
        self.meta.retain_local(|name| local.files.contains_key(name));
        if let Err(e) = self.meta.save() {
            warn!("cannot persist metadata cache: {e}");
        }

        let remote = {
            let mut conn = self.conn.lock().await;
            let session = match conn.ensure_connected().await {
                Ok(session) => session,
                Err(e) => {
                    debug!("connect failed: {e}");
                    return;
                }
            };
            match mirror::list_remote(session).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    conn.teardown(&format!("listing failed: {e}"));
                    return;
                }
            }
        };

        let plan = mirror::compute_plan(&local, &remote, &modified, &self.plan_opts);
        emit(
            &self.events,
            SyncEvent::PassStarted {
                pass_id,
                ops: plan.len(),
            },
        );
        if !plan.is_empty() {
            info!("pass {pass_id}: {} operation(s)", plan.len());
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for op in &plan.ops {
            match self.execute_op(op).await {
                Ok(bytes) => {
                    succeeded += 1;
                    self.log_op(pass_id, op, bytes, None);
                    emit(
                        &self.events,
                        SyncEvent::OpSucceeded {
                            pass_id,
                            op: op.clone(),
                        },
                    );
                }
                Err(e) => {
                    failed += 1;
                    self.log_op(pass_id, op, 0, Some(e.to_string()));
                    emit(
                        &self.events,
                        SyncEvent::OpFailed {
                            pass_id,
                            op: op.clone(),
                            error: e.to_string(),
                        },
                    );
                    if e.is_connection_loss() {
                        // Session is already torn down; the remaining plan
                        // entries are re-derived after reconnection.
                        break;
                    }
                }
            }
        }

        emit(
            &self.events,
            SyncEvent::PassFinished {
                pass_id,
                succeeded,
                failed,
            },
        );
    }

    /// Connect and make sure the board is idle. Uploading while the board
    /// reads the job it is printing corrupts the print.
    async fn check_gate(&mut self, pass_id: Uuid) -> PassGate {
        let mut conn = self.conn.lock().await;
        let session = match conn.ensure_connected().await {
            Ok(session) => session,
            Err(e) => {
                debug!("connect failed: {e}");
                return PassGate::Unavailable;
            }
        };
        let reply = match session.exchange(&Command::QueryStatus).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.teardown(&format!("status check failed: {e}"));
                return PassGate::Unavailable;
            }
        };
        match protocol::parse_status_reply(&reply) {
            Some(StatusReply::Idle) => PassGate::Ready,
            Some(_) => {
                emit(&self.events, SyncEvent::PassSkippedPrinting { pass_id });
                debug!("board is printing, pass {pass_id} deferred");
                PassGate::Printing
            }
            None => {
                conn.teardown("unparseable status reply");
                PassGate::Unavailable
            }
        }
    }

    /// Start the short-cadence status poller unless one is already
    /// running. It republishes print status until the board reports idle
    /// or the connection drops.
    fn ensure_status_poll(&mut self) {
        if matches!(&self.poll_task, Some(task) if !task.is_finished()) {
            return;
        }
        let controller = self.controller.clone();
        self.poll_task = Some(tokio::spawn(async move {
            let _ = controller.watch_job().await;
        }));
    }

    async fn liveness_ping(&mut self) {
        let mut conn = self.conn.lock().await;
        let Ok(session) = conn.ensure_connected().await else {
            return;
        };
        if let Err(e) = session.exchange(&Command::Handshake).await {
            conn.teardown(&format!("ping failed: {e}"));
        }
    }

    /// Execute one plan entry to completion. Returns the bytes shipped for
    /// the operation log.
    async fn execute_op(&mut self, op: &PlanOp) -> Result<u64, SyncError> {
        match op {
            PlanOp::Upload(name) => {
                let path = self.config.sync_folder.join(name);
                wait_for_stable(&path, name).await?;

                let mut conn = self.conn.lock().await;
                let chunk_delay = conn.endpoint().chunk_delay;
                let session = conn.ensure_connected().await?;
                match transfer::upload(session, &path, name, chunk_delay, &self.events).await {
                    Ok(()) => {
                        drop(conn);
                        if let Err(e) = self.meta.record_uploaded(name, &path) {
                            warn!("uploaded {name} but cannot cache metadata: {e}");
                        }
                        let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                        Ok(bytes)
                    }
                    Err(e) => {
                        if e.is_connection_loss() {
                            conn.teardown(&format!("upload of {name} failed: {e}"));
                        }
                        Err(e.into())
                    }
                }
            }
            PlanOp::Delete(name) => {
                let mut conn = self.conn.lock().await;
                let session = conn.ensure_connected().await?;
                let cmd = Command::Delete(name.clone());
                match session.exchange(&cmd).await {
                    Ok(reply) if protocol::is_error_reply(&reply) => Err(ProtocolError::Rejected {
                        cmd: cmd.encode(),
                        reply,
                    }
                    .into()),
                    Ok(_) => {
                        drop(conn);
                        self.meta.remove(name);
                        Ok(0)
                    }
                    Err(e) => {
                        conn.teardown(&format!("delete of {name} failed: {e}"));
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn log_op(&self, pass_id: Uuid, op: &PlanOp, bytes: u64, error: Option<String>) {
        let Some(ref log) = self.oplog else { return };
        let kind = match op {
            PlanOp::Upload(_) => "upload",
            PlanOp::Delete(_) => "delete",
        };
        let entry = OpLog::entry(&pass_id.to_string(), kind, op.file_name(), bytes, error);
        if let Err(e) = log.append(&entry) {
            warn!("cannot append operation log: {e}");
        }
    }
}

impl Drop for Pipeline {
    // The poller would otherwise outlive the pipeline and keep the event
    // channel open
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

/// Watch the sync folder and forward print-file names. The notify callback
/// runs on its own thread; sending into an unbounded channel never blocks
/// it.
fn spawn_watcher(
    folder: &Path,
    tx: mpsc::UnboundedSender<String>,
) -> Result<RecommendedWatcher, ConfigError> {
    let watch_err = |source| ConfigError::Watch {
        path: folder.to_path_buf(),
        source,
    };
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                for path in event.paths {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if protocol::is_print_file(name) {
                            let _ = tx.send(name.to_string());
                        }
                    }
                }
            }
        })
        .map_err(watch_err)?;
    watcher
        .watch(folder, RecursiveMode::NonRecursive)
        .map_err(watch_err)?;
    Ok(watcher)
}

/// Wait until the file's size has held still for `STABLE_WINDOW`, bounded
/// by `STABLE_DEADLINE`. Slicers write multi-hundred-megabyte files in
/// visible bursts; shipping one mid-write wastes a full transfer.
async fn wait_for_stable(path: &Path, name: &str) -> Result<(), TransferError> {
    let deadline = Instant::now() + STABLE_DEADLINE;
    let mut last_size: Option<u64> = None;
    let mut stable_since: Option<Instant> = None;
    while Instant::now() < deadline {
        let size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
        if size.is_some() && size == last_size {
            let since = *stable_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= STABLE_WINDOW {
                return Ok(());
            }
        } else {
            stable_since = None;
            last_size = size;
        }
        tokio::time::sleep(STABLE_CHECK).await;
    }
    Err(TransferError::Unstable {
        name: name.to_string(),
    })
}
