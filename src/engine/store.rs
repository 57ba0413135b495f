use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::engine::{models::ExecutionSummary, sandbox::lock};

/// Hand-off point for finished sessions: a bounded recent history plus an
/// optional JSONL file for whatever layer persists reports.
#[derive(Clone)]
pub struct SummaryStore {
    recent: Arc<std::sync::Mutex<VecDeque<ExecutionSummary>>>,
    capacity: usize,
    persistence_path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl SummaryStore {
    pub fn new(capacity: usize, persistence_path: Option<PathBuf>) -> Self {
        Self {
            recent: Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            persistence_path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn record(&self, summary: ExecutionSummary) {
        if self.capacity > 0 {
            let mut recent = lock(&self.recent);
            while recent.len() >= self.capacity {
                recent.pop_front();
            }
            recent.push_back(summary.clone());
        }

        let Some(path) = &self.persistence_path else {
            return;
        };
        let line = match serde_json::to_string(&summary) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize execution summary");
                return;
            }
        };

        let _guard = self.write_lock.lock().await;
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        // tokio's File finishes writes in the background; flush before the
        // lock is released so readers see whole lines.
        let written = async {
            let mut file = options.open(path).await?;
            file.write_all(format!("{line}\n").as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::warn!(path = %path.display(), error = %err, "failed to persist execution summary");
        }
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<ExecutionSummary> {
        lock(&self.recent).iter().rev().take(limit).cloned().collect()
    }

    pub fn find(&self, session_id: &str) -> Option<ExecutionSummary> {
        lock(&self.recent)
            .iter()
            .find(|summary| summary.session_id == session_id)
            .cloned()
    }
}
