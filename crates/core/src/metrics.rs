//! Training history and the scalar event log.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("event log I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("event serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// KNN result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub epoch: usize,
    pub top1: f64,
    pub top5: f64,
}

/// Everything a run reports back once it finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub evaluations: Vec<EvalRecord>,
    /// Mean training loss per epoch.
    pub epoch_losses: Vec<f64>,
    pub steps: usize,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_eval(&mut self, epoch: usize, top1: f64, top5: f64) {
        self.evaluations.push(EvalRecord { epoch, top1, top5 });
    }

    pub fn record_epoch_loss(&mut self, loss: f64) {
        self.epoch_losses.push(loss);
    }

    pub fn top1(&self) -> Vec<f64> {
        self.evaluations.iter().map(|e| e.top1).collect()
    }

    pub fn top5(&self) -> Vec<f64> {
        self.evaluations.iter().map(|e| e.top5).collect()
    }

    pub fn best_top1(&self) -> Option<f64> {
        self.evaluations.iter().map(|e| e.top1).reduce(f64::max)
    }

    pub fn best_top5(&self) -> Option<f64> {
        self.evaluations.iter().map(|e| e.top5).reduce(f64::max)
    }

    pub fn last(&self) -> Option<&EvalRecord> {
        self.evaluations.last()
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    pub wall_time: f64,
}

/// Append-only JSON-lines scalar log at `<root>/<name>/events.jsonl`.
///
/// A disabled writer accepts and drops every event; non-coordinator ranks
/// hold one.
pub struct EventWriter {
    sink: Option<(PathBuf, BufWriter<File>)>,
}

impl EventWriter {
    pub fn create(root: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = root.as_ref().join(name);
        fs::create_dir_all(&dir).map_err(|source| MetricsError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(EVENTS_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| MetricsError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::info!(path = %path.display(), "writing events");
        Ok(Self {
            sink: Some((path, BufWriter::new(file))),
        })
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(p, _)| p.as_path())
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let Some((path, writer)) = self.sink.as_mut() else {
            return Ok(());
        };
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(writer, "{line}").map_err(|source| MetricsError::Io {
            path: path.clone(),
            source,
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some((path, writer)) = self.sink.as_mut() {
            writer.flush().map_err(|source| MetricsError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush event log");
        }
    }
}

/// Read every event of a log written by [`EventWriter`].
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<ScalarEvent>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| MetricsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(MetricsError::from))
        .collect()
}
