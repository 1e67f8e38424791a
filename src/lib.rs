//! chitusync - folder mirroring for ChiTu-class resin printer mainboards
//!
//! Keeps a local folder of sliced print files synchronized onto a printer's
//! USB storage over the board's line-oriented M-code protocol (port 3000):
//! chunked writes with per-chunk checksums and acks, a size-only remote
//! listing, and print start/stop/status control. One TCP session, one
//! outstanding command, reconciliation one operation at a time.

pub mod config;
pub mod error;
pub mod events;
pub mod metadata;
pub mod mirror;
pub mod oplog;
pub mod print_job;
pub mod progress;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod transfer;
