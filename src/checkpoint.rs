//! Crawl checkpoints.
//!
//! A checkpoint captures the scheduler (pending queue with its ordering keys,
//! seen fingerprints, salvaged requests) and the state of every pipeline that
//! reports one. It is encoded with MessagePack and written to a temporary
//! file that is then renamed over the previous checkpoint, so a crash while
//! saving leaves the last good checkpoint in place.

use crate::error::SpiderError;
use crate::fingerprint::Fingerprint;
use crate::item::ScrapedItem;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::scheduler::queue::{QueueOrder, QueuedRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File name of the checkpoint inside a job directory.
pub const CHECKPOINT_FILE: &str = "crawl.checkpoint";

/// A snapshot of the scheduler's state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerCheckpoint {
    pub order: QueueOrder,
    pub queue: Vec<QueuedRequest>,
    pub seen: Vec<Fingerprint>,
    /// Requests enqueued after the crawl stopped admitting work.
    pub salvaged: Vec<Request>,
}

impl SchedulerCheckpoint {
    pub fn pending(&self) -> usize {
        self.queue.len() + self.salvaged.len()
    }
}

/// Everything persisted for a resumable crawl.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scheduler: SchedulerCheckpoint,
    /// Pipeline states keyed by pipeline name.
    pub pipelines: HashMap<String, Value>,
    /// RFC 3339 timestamp of the save.
    pub saved_at: String,
}

pub fn checkpoint_path(job_dir: &Path) -> PathBuf {
    job_dir.join(CHECKPOINT_FILE)
}

pub async fn save_checkpoint<I: ScrapedItem>(
    path: &Path,
    scheduler: SchedulerCheckpoint,
    pipelines: &[Box<dyn Pipeline<I>>],
) -> Result<(), SpiderError> {
    info!(
        "Saving checkpoint to {:?} ({} queued, {} seen, {} salvaged)",
        path,
        scheduler.queue.len(),
        scheduler.seen.len(),
        scheduler.salvaged.len()
    );

    let mut pipeline_states = HashMap::new();
    for pipeline in pipelines {
        if let Some(state) = pipeline.get_state().await? {
            pipeline_states.insert(pipeline.name().to_string(), state);
        }
    }

    let checkpoint = Checkpoint {
        scheduler,
        pipelines: pipeline_states,
        saved_at: chrono::Utc::now().to_rfc3339(),
    };

    let encoded = rmp_serde::to_vec_named(&checkpoint)
        .map_err(|e| SpiderError::GeneralError(format!("Failed to serialize checkpoint: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, encoded)?;
    fs::rename(&tmp_path, path)?;

    info!("Checkpoint saved.");
    Ok(())
}

/// Loads the checkpoint at `path`. A missing file is not an error.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>, SpiderError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let checkpoint: Checkpoint = rmp_serde::from_slice(&bytes).map_err(|e| {
        SpiderError::CorruptedState(format!("checkpoint {:?} cannot be decoded: {}", path, e))
    })?;
    if !checkpoint.scheduler.salvaged.is_empty() {
        warn!(
            "Checkpoint holds {} salvaged requests; they will be re-queued.",
            checkpoint.scheduler.salvaged.len()
        );
    }
    info!(
        "Loaded checkpoint from {:?} saved at {} with {} pending requests.",
        path,
        checkpoint.saved_at,
        checkpoint.scheduler.pending()
    );
    Ok(Some(checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use async_trait::async_trait;

    struct CountingPipeline;

    #[async_trait]
    impl Pipeline<String> for CountingPipeline {
        fn name(&self) -> &str {
            "counting"
        }

        async fn process_item(&self, item: String) -> Result<Option<String>, PipelineError> {
            Ok(Some(item))
        }

        async fn get_state(&self) -> Result<Option<Value>, SpiderError> {
            Ok(Some(serde_json::json!({ "count": 3 })))
        }
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir.path().join("job"));
        let request = Request::get("http://example.com/a").unwrap();

        let scheduler = SchedulerCheckpoint {
            order: QueueOrder::Lifo,
            queue: Vec::new(),
            seen: vec![request.fingerprint()],
            salvaged: vec![request],
        };
        let pipelines: Vec<Box<dyn Pipeline<String>>> = vec![Box::new(CountingPipeline)];
        save_checkpoint(&path, scheduler, &pipelines).await.unwrap();

        let loaded = load_checkpoint(&path).unwrap().unwrap();
        assert_eq!(loaded.scheduler.order, QueueOrder::Lifo);
        assert_eq!(loaded.scheduler.seen.len(), 1);
        assert_eq!(loaded.scheduler.pending(), 1);
        assert_eq!(loaded.pipelines["counting"]["count"], 3);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_checkpoint(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn garbage_is_corrupted_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        fs::write(&path, b"\xc1\xc1 not msgpack").unwrap();
        assert!(matches!(load_checkpoint(&path), Err(SpiderError::CorruptedState(_))));
    }
}
