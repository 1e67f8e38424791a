//! Engine configuration
//!
//! Loaded once from an optional TOML file plus CLI overrides, validated,
//! then treated as immutable. Changing any value means building a fresh
//! pipeline; nothing mutates a running one.

use crate::error::ConfigError;
use crate::protocol;
use crate::session::PrinterEndpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sidecar file in the sync folder holding the local metadata cache.
pub const METADATA_FILE: &str = ".chitusync_meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Folder whose print files mirror onto the board.
    pub sync_folder: PathBuf,

    /// Printer host or IP.
    pub printer_host: String,

    /// Control port, almost always 3000.
    pub printer_port: u16,

    /// Reconnect cadence while the printer is offline, in minutes.
    /// Connection attempts are never made faster than this.
    pub ping_interval_minutes: u64,

    /// Pause between file-write chunks, in milliseconds. Protects the
    /// board's small receive buffer; raise it if transfers corrupt.
    pub chunk_delay_ms: u64,

    /// Delete files from the board that are gone locally.
    pub remote_delete: bool,

    /// Full mirror-pass cadence while connected, in seconds.
    pub mirror_interval_secs: u64,

    /// Status poll cadence while a print is running, in seconds.
    pub status_poll_secs: u64,

    /// Optional JSONL log of reconciliation operations.
    pub op_log: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_folder: PathBuf::new(),
            printer_host: String::new(),
            printer_port: protocol::DEFAULT_PORT,
            ping_interval_minutes: 1,
            chunk_delay_ms: 5,
            remote_delete: true,
            mirror_interval_secs: 300,
            status_poll_secs: 2,
            op_log: None,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Unparsable {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.printer_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.ping_interval_minutes == 0 {
            return Err(ConfigError::BadPingInterval);
        }
        if !self.sync_folder.is_dir() {
            return Err(ConfigError::BadFolder(self.sync_folder.clone()));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> PrinterEndpoint {
        PrinterEndpoint {
            host: self.printer_host.clone(),
            port: self.printer_port,
            ping_interval: Duration::from_secs(self.ping_interval_minutes * 60),
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.sync_folder.join(METADATA_FILE)
    }

    pub fn mirror_interval(&self) -> Duration {
        Duration::from_secs(self.mirror_interval_secs.max(1))
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config(folder: &Path) -> SyncConfig {
        SyncConfig {
            sync_folder: folder.to_path_buf(),
            printer_host: "192.168.0.230".into(),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_validate_accepts_good_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(valid_config(dir.path()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.printer_host = "   ".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyHost)));
    }

    #[test]
    fn test_validate_rejects_zero_ping_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.ping_interval_minutes = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::BadPingInterval)));
    }

    #[test]
    fn test_validate_rejects_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.sync_folder = dir.path().join("nope");
        assert!(matches!(cfg.validate(), Err(ConfigError::BadFolder(_))));
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chitusync.toml");
        std::fs::write(
            &path,
            r#"
sync_folder = "/tmp/prints"
printer_host = "10.0.0.9"
chunk_delay_ms = 20
remote_delete = false
"#,
        )
        .unwrap();
        let cfg = SyncConfig::load(&path).unwrap();
        assert_eq!(cfg.printer_host, "10.0.0.9");
        assert_eq!(cfg.printer_port, protocol::DEFAULT_PORT);
        assert_eq!(cfg.chunk_delay_ms, 20);
        assert!(!cfg.remote_delete);
        assert_eq!(cfg.endpoint().chunk_delay, Duration::from_millis(20));
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chitusync.toml");
        std::fs::write(&path, "printer_ip = \"10.0.0.9\"\n").unwrap();
        assert!(matches!(
            SyncConfig::load(&path),
            Err(ConfigError::Unparsable { .. })
        ));
    }
}
