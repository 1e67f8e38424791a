//! JSONL log of reconciliation operations
//!
//! Opt-in append-only record of what each pass did, one JSON object per
//! line, for postmortems when a board mangles a transfer.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct OpLogEntry {
    pub timestamp: String,
    pub pass_id: String,
    pub operation: String,
    pub file: String,
    pub bytes: u64,
    pub status: OpStatus,
    pub error: Option<String>,
}

pub struct OpLog {
    path: PathBuf,
}

impl OpLog {
    pub fn new(path: &Path) -> Self {
        OpLog {
            path: path.to_path_buf(),
        }
    }

    pub fn entry(
        pass_id: &str,
        operation: &str,
        file: &str,
        bytes: u64,
        error: Option<String>,
    ) -> OpLogEntry {
        OpLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            pass_id: pass_id.to_string(),
            operation: operation.to_string(),
            file: file.to_string(),
            bytes,
            status: if error.is_none() {
                OpStatus::Completed
            } else {
                OpStatus::Failed
            },
            error,
        }
    }

    pub fn append(&self, entry: &OpLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open operation log")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<OpLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("Failed to open operation log for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
