//! JSON-file job storage.
//!
//! All jobs live in one JSON document that is rewritten on every mutation
//! (temp file + rename). On [`setup`](JobStorage::setup), jobs left
//! `Processing` by a crashed process are put back to `Pending`.

use super::{next_pending, JobStorage};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Default)]
struct FileState {
    loaded: bool,
    jobs: HashMap<JobId, Job>,
    next_sequence: u64,
}

/// Job storage persisted as a JSON array on disk.
pub struct JsonFileJobStorage {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl JsonFileJobStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(FileState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, state: &FileState) -> Result<()> {
        let mut jobs: Vec<&Job> = state.jobs.values().collect();
        jobs.sort_by_key(|j| j.sequence);
        let json = serde_json::to_string_pretty(&jobs)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn ensure_loaded(state: &FileState) -> Result<()> {
    if state.loaded {
        Ok(())
    } else {
        Err(QueueError::NotInitialized)
    }
}

#[async_trait]
impl JobStorage for JsonFileJobStorage {
    async fn setup(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.loaded {
            return Ok(());
        }

        let jobs: Vec<Job> = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0usize;
        for mut job in jobs {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.started_at = None;
                recovered += 1;
            }
            state.next_sequence = state.next_sequence.max(job.sequence);
            state.jobs.insert(job.id.clone(), job);
        }
        state.loaded = true;

        if recovered > 0 {
            tracing::info!(path = %self.path.display(), recovered, "re-queued interrupted jobs");
            self.flush(&state).await?;
        }
        tracing::debug!(path = %self.path.display(), jobs = state.jobs.len(), "job file loaded");
        Ok(())
    }

    async fn put(&self, mut job: Job) -> Result<JobId> {
        let mut state = self.state.lock().await;
        ensure_loaded(&state)?;
        match state.jobs.get(&job.id) {
            Some(existing) => job.sequence = existing.sequence,
            None => {
                state.next_sequence += 1;
                job.sequence = state.next_sequence;
            }
        }
        let id = job.id.clone();
        state.jobs.insert(id.clone(), job);
        self.flush(&state).await?;
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        ensure_loaded(&state)?;
        Ok(state.jobs.get(id).cloned())
    }

    async fn delete(&self, id: &JobId) -> Result<bool> {
        let mut state = self.state.lock().await;
        ensure_loaded(&state)?;
        let removed = state.jobs.remove(id).is_some();
        if removed {
            self.flush(&state).await?;
        }
        Ok(removed)
    }

    async fn get_all(&self, queue: &str) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        ensure_loaded(&state)?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.sequence);
        Ok(jobs)
    }

    async fn size(&self, queue: &str, status: Option<JobStatus>) -> Result<usize> {
        let state = self.state.lock().await;
        ensure_loaded(&state)?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.queue == queue && status.map_or(true, |s| j.status == s))
            .count())
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        ensure_loaded(&state)?;
        let Some(id) = next_pending(state.jobs.values(), queue).map(|j| j.id.clone()) else {
            return Ok(None);
        };
        let claimed = state.jobs.get_mut(&id).map(|job| {
            job.mark_processing();
            job.clone()
        });
        self.flush(&state).await?;
        Ok(claimed)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        ensure_loaded(&state)?;
        state.jobs.retain(|_, j| j.queue != queue);
        self.flush(&state).await
    }
}
