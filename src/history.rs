//! Sweep history sink.
//!
//! Keeps the most recent sweeps in a small JSON file so an operator can see
//! when ramps ran. File access runs on the blocking pool. Failures to persist
//! are logged and otherwise ignored; the sweep itself never depends on the
//! file.

use crate::error::ControlResult;
use crate::sweep::{SweepDirection, SweepParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    /// When the sweep started
    pub started_at: DateTime<Utc>,
    /// When the sweep ended, if it has
    pub stopped_at: Option<DateTime<Utc>>,
    /// Starting pressure (mBar)
    pub start_pressure_mbar: i32,
    /// Requested span (mBar)
    pub span: i32,
    /// Steps per second
    pub rate: u32,
    /// Direction of travel
    pub direction: SweepDirection,
}

/// JSON-backed list of recent sweeps.
#[derive(Debug, Clone)]
pub struct SweepHistory {
    path: PathBuf,
    keep: usize,
    // Serialises read-modify-write cycles
    writer: Arc<Mutex<()>>,
}

impl SweepHistory {
    /// History stored at `path`, retaining `keep` records.
    pub fn new(path: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            path: path.into(),
            keep: keep.max(1),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All retained records, oldest first. A missing file is empty.
    pub fn records(&self) -> ControlResult<Vec<SweepRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Append a record for a sweep that just started.
    pub async fn record_start(&self, params: &SweepParams) {
        let record = SweepRecord {
            started_at: Utc::now(),
            stopped_at: None,
            start_pressure_mbar: params.start_mbar,
            span: params.span,
            rate: params.rate,
            direction: params.direction,
        };
        self.update_blocking("start", move |records| records.push(record)).await;
    }

    /// Stamp the most recent open record as stopped.
    pub async fn record_stop(&self) {
        let stopped_at = Utc::now();
        self.update_blocking("stop", move |records| {
            match records.iter_mut().rev().find(|r| r.stopped_at.is_none()) {
                Some(open) => open.stopped_at = Some(stopped_at),
                None => tracing::debug!("No open sweep record to close"),
            }
        })
        .await;
    }

    async fn update_blocking<F>(&self, what: &'static str, change: F)
    where
        F: FnOnce(&mut Vec<SweepRecord>) + Send + 'static,
    {
        let _writing = self.writer.lock().await;
        let history = self.clone();
        let result = tokio::task::spawn_blocking(move || history.update(change)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                "Could not record sweep {} in {}: {}",
                what,
                self.path.display(),
                e
            ),
            Err(e) => tracing::warn!("Sweep history task failed: {}", e),
        }
    }

    fn update(&self, change: impl FnOnce(&mut Vec<SweepRecord>)) -> ControlResult<()> {
        let mut records = self.records()?;
        change(&mut records);
        if records.len() > self.keep {
            let excess = records.len() - self.keep;
            records.drain(..excess);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&records)?)?;
        Ok(())
    }
}
