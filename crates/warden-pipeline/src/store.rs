//! On-disk layout of one pipeline and the commit protocol.
//!
//! ```text
//! <graph>.dot                         live status document
//! <state>/checkpoints/<id>/NNNNNN.dot append-only snapshots (authoritative)
//! <state>/audit/<id>.jsonl            hash-chained audit log
//! <state>/signals/<id>/<participant>/ signal inboxes
//! <state>/<id>.lock                   single-writer lock for commits
//! ```
//!
//! The latest checkpoint is the source of truth. The graph file mirrors it and
//! is rewritten from the checkpoint whenever the two disagree.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use warden_audit::AuditLog;
use warden_signal::SignalChannel;
use warden_types::fs::write_atomic;
use warden_types::lock::FileLock;
use warden_types::retry::BackoffPolicy;
use warden_types::{Result, WardenError};

use crate::checkpoint::{CheckpointInfo, CheckpointStore};
use crate::config::WardenConfig;
use crate::graph::PipelineGraph;
use crate::validation::validate_or_raise;

#[derive(Debug, Clone)]
pub struct PipelineStore {
    pipeline_id: String,
    graph_path: PathBuf,
    state_dir: PathBuf,
    checkpoints: CheckpointStore,
    lock_attempts: usize,
    lock_policy: BackoffPolicy,
}

impl PipelineStore {
    /// Locate the state for the graph file at `graph_path`. Nothing is created yet.
    pub fn open(graph_path: impl Into<PathBuf>, config: &WardenConfig) -> Result<Self> {
        let graph_path = graph_path.into();
        let pipeline_id = graph_path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(String::from)
            .ok_or_else(|| {
                WardenError::Config(format!(
                    "cannot derive a pipeline id from {}",
                    graph_path.display()
                ))
            })?;
        warden_signal::validate_name("pipeline", &pipeline_id)?;

        let base = graph_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let state_dir = config.state_dir_from(base);

        Ok(Self {
            checkpoints: CheckpointStore::new(state_dir.join("checkpoints").join(&pipeline_id)),
            pipeline_id,
            graph_path,
            state_dir,
            lock_attempts: config.lock.attempts,
            lock_policy: config.lock.policy(),
        })
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn graph_path(&self) -> &Path {
        &self.graph_path
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn audit_path(&self) -> PathBuf {
        self.state_dir
            .join("audit")
            .join(format!("{}.jsonl", self.pipeline_id))
    }

    pub fn audit_log(&self) -> Result<AuditLog> {
        Ok(AuditLog::open(self.audit_path())?
            .with_lock_retry(self.lock_attempts, self.lock_policy.clone()))
    }

    pub fn signals(&self) -> SignalChannel {
        SignalChannel::new(self.state_dir.join("signals").join(&self.pipeline_id))
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.lock", self.pipeline_id))
    }

    /// Take the pipeline's single-writer lock, waiting a bounded time.
    pub fn lock(&self) -> Result<FileLock> {
        fs::create_dir_all(&self.state_dir)?;
        FileLock::acquire(&self.lock_path(), self.lock_attempts, &self.lock_policy)
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.checkpoints.latest_seq()?.is_some())
    }

    /// Parse the graph file as it currently is on disk.
    pub fn read_graph_file(&self) -> Result<PipelineGraph> {
        let text = fs::read_to_string(&self.graph_path)?;
        PipelineGraph::parse(&text)
    }

    /// Read-only view: the latest checkpoint, or the graph file for a
    /// pipeline that has not been initialized yet.
    pub fn load(&self) -> Result<PipelineGraph> {
        match self.checkpoints.latest()? {
            Some(graph) => {
                if let Ok(file) = self.read_graph_file() {
                    if file.revision() != graph.revision() {
                        tracing::warn!(
                            pipeline = %self.pipeline_id,
                            file_revision = file.revision(),
                            checkpoint_revision = graph.revision(),
                            "graph file differs from latest checkpoint; using checkpoint"
                        );
                    }
                }
                Ok(graph)
            }
            None => self.read_graph_file(),
        }
    }

    /// Load for mutation while holding the lock. Reconciles the graph file
    /// with the latest checkpoint before returning.
    pub fn load_for_update(&self, _lock: &FileLock) -> Result<PipelineGraph> {
        let graph = self.checkpoints.latest()?.ok_or_else(|| {
            WardenError::Config(format!(
                "pipeline '{}' is not initialized; run `warden init` first",
                self.pipeline_id
            ))
        })?;

        let in_sync = self
            .read_graph_file()
            .is_ok_and(|file| file.revision() == graph.revision());
        if !in_sync {
            tracing::warn!(
                pipeline = %self.pipeline_id,
                revision = graph.revision(),
                "rewriting graph file from latest checkpoint"
            );
            write_atomic(&self.graph_path, graph.to_dot_string().as_bytes())?;
        }
        Ok(graph)
    }

    /// Persist a mutated graph: bump the revision, snapshot it as a new
    /// checkpoint, then mirror it into the graph file.
    pub fn commit(&self, _lock: &FileLock, graph: &mut PipelineGraph) -> Result<CheckpointInfo> {
        let meta = graph.meta_mut();
        meta.revision += 1;
        if meta.session.is_none() {
            meta.session = Some(uuid::Uuid::new_v4().to_string());
        }
        let info = self.checkpoints.save(graph, Utc::now())?;
        write_atomic(&self.graph_path, graph.to_dot_string().as_bytes())?;
        tracing::debug!(
            pipeline = %self.pipeline_id,
            revision = info.revision,
            seq = info.seq,
            "committed"
        );
        Ok(info)
    }

    /// Import a hand-written graph file as checkpoint 0.
    pub fn init(&self) -> Result<(PipelineGraph, CheckpointInfo)> {
        let lock = self.lock()?;
        if self.is_initialized()? {
            return Err(WardenError::Config(format!(
                "pipeline '{}' is already initialized",
                self.pipeline_id
            )));
        }
        let mut graph = self.read_graph_file()?;
        validate_or_raise(&graph)?;
        let info = self.commit(&lock, &mut graph)?;
        tracing::info!(pipeline = %self.pipeline_id, session = ?graph.session(), "pipeline initialized");
        Ok((graph, info))
    }

    /// Re-import the graph file, as edited by an operator, as a new checkpoint.
    ///
    /// Session and revision continue from the latest checkpoint.
    pub fn import(&self) -> Result<(PipelineGraph, CheckpointInfo)> {
        let lock = self.lock()?;
        let mut graph = self.read_graph_file()?;
        validate_or_raise(&graph)?;
        if let Some(current) = self.checkpoints.latest()? {
            let meta = graph.meta_mut();
            meta.revision = current.revision();
            if meta.session.is_none() {
                meta.session = current.meta().session.clone();
            }
        }
        let info = self.commit(&lock, &mut graph)?;
        tracing::info!(pipeline = %self.pipeline_id, seq = info.seq, "graph file imported");
        Ok((graph, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"digraph demo {
        graph [ticket="T-1"]
        a [handler="codegen"]
        b
        a -> b
    }"#;

    fn setup() -> (tempfile::TempDir, PipelineStore) {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("demo.dot");
        fs::write(&path, SRC).unwrap();
        let store = PipelineStore::open(&path, &WardenConfig::default()).unwrap();
        (temp, store)
    }

    #[test]
    fn layout_is_derived_from_graph_path() {
        let (temp, store) = setup();
        assert_eq!(store.pipeline_id(), "demo");
        assert_eq!(store.state_dir(), temp.path().join(".warden"));
        assert_eq!(
            store.audit_path(),
            temp.path().join(".warden/audit/demo.jsonl")
        );
        assert_eq!(
            store.signals().root(),
            temp.path().join(".warden/signals/demo")
        );
    }

    #[test]
    fn init_writes_checkpoint_zero_and_session() {
        let (_temp, store) = setup();
        let (graph, info) = store.init().unwrap();
        assert_eq!(info.seq, 0);
        assert_eq!(graph.revision(), 1);
        assert!(graph.session().is_some());

        let file = store.read_graph_file().unwrap();
        assert_eq!(file, graph);
    }

    #[test]
    fn init_twice_is_refused() {
        let (_temp, store) = setup();
        store.init().unwrap();
        assert!(store.init().is_err());
    }

    #[test]
    fn init_rejects_invalid_graph() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bad.dot");
        fs::write(&path, "digraph bad { a -> b -> a }").unwrap();
        let store = PipelineStore::open(&path, &WardenConfig::default()).unwrap();
        assert!(matches!(store.init(), Err(WardenError::ValidationError(_))));
        assert!(!store.is_initialized().unwrap());
    }

    #[test]
    fn commit_bumps_revision_and_mirrors_file() {
        let (_temp, store) = setup();
        store.init().unwrap();

        let lock = store.lock().unwrap();
        let mut graph = store.load_for_update(&lock).unwrap();
        let info = store.commit(&lock, &mut graph).unwrap();
        drop(lock);

        assert_eq!(info.seq, 1);
        assert_eq!(info.revision, 2);
        assert_eq!(store.load().unwrap(), graph);
        assert_eq!(store.read_graph_file().unwrap().revision(), 2);
    }

    #[test]
    fn stale_graph_file_is_rewritten_from_checkpoint() {
        let (_temp, store) = setup();
        let (graph, _) = store.init().unwrap();
        fs::write(store.graph_path(), SRC).unwrap();

        let lock = store.lock().unwrap();
        let loaded = store.load_for_update(&lock).unwrap();
        assert_eq!(loaded, graph);
        assert_eq!(store.read_graph_file().unwrap(), graph);
    }

    #[test]
    fn missing_graph_file_is_restored() {
        let (_temp, store) = setup();
        let (graph, _) = store.init().unwrap();
        fs::remove_file(store.graph_path()).unwrap();

        let lock = store.lock().unwrap();
        store.load_for_update(&lock).unwrap();
        assert_eq!(store.read_graph_file().unwrap(), graph);
    }

    #[test]
    fn uninitialized_pipeline_cannot_be_updated() {
        let (_temp, store) = setup();
        let lock = store.lock().unwrap();
        assert!(store.load_for_update(&lock).is_err());
        drop(lock);
        assert_eq!(store.load().unwrap().node_count(), 2);
    }

    #[test]
    fn import_continues_session_and_revision() {
        let (_temp, store) = setup();
        let (first, _) = store.init().unwrap();

        let edited = SRC.replacen("b\n", "b\n        c\n        b -> c\n", 1);
        fs::write(store.graph_path(), edited).unwrap();
        let (graph, info) = store.import().unwrap();

        assert_eq!(info.seq, 1);
        assert_eq!(graph.revision(), first.revision() + 1);
        assert_eq!(graph.session(), first.session());
        assert!(graph.contains("c"));
    }

    #[test]
    fn lock_is_exclusive() {
        let (_temp, store) = setup();
        let held = store.lock().unwrap();
        let err = FileLock::try_acquire(&store.lock_path()).unwrap_err();
        assert!(err.is_retryable());
        drop(held);
        assert!(store.lock().is_ok());
    }
}
