//! Append-only checkpoint store.
//!
//! Each checkpoint is a complete graph file, `<seq:06>.dot`, written once and
//! never overwritten. The highest sequence number is the latest; older ones
//! are kept as history.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

use warden_types::fs::write_atomic_new;
use warden_types::{Result, WardenError};

use crate::graph::PipelineGraph;

const CHECKPOINT_EXT: &str = "dot";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointInfo {
    pub seq: u64,
    pub revision: u64,
    pub saved_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:06}.{CHECKPOINT_EXT}"))
    }

    /// Sequence numbers present on disk, ascending.
    pub fn sequences(&self) -> Result<Vec<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seqs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            if let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    pub fn latest_seq(&self) -> Result<Option<u64>> {
        Ok(self.sequences()?.last().copied())
    }

    /// Snapshot `graph` as the next checkpoint. The graph's `checkpoint_seq`
    /// and `checkpoint_at` are updated to describe the new snapshot.
    pub fn save(&self, graph: &mut PipelineGraph, now: DateTime<Utc>) -> Result<CheckpointInfo> {
        fs::create_dir_all(&self.dir)?;
        // The file keeps microseconds; match it so the in-memory graph equals a reload.
        let now = now.trunc_subsecs(6);
        let seq = self.latest_seq()?.map_or(0, |s| s + 1);
        let path = self.path_for(seq);

        let meta = graph.meta_mut();
        meta.checkpoint_seq = Some(seq);
        meta.checkpoint_at = Some(now);

        write_atomic_new(&path, graph.to_dot_string().as_bytes())?;
        tracing::debug!(seq, revision = graph.revision(), path = %path.display(), "checkpoint saved");

        Ok(CheckpointInfo {
            seq,
            revision: graph.revision(),
            saved_at: Some(now),
            path,
        })
    }

    /// Load one checkpoint. A checkpoint that no longer parses, or whose
    /// recorded sequence disagrees with its file name, is corrupt.
    pub fn load(&self, seq: u64) -> Result<PipelineGraph> {
        let path = self.path_for(seq);
        let text = fs::read_to_string(&path)?;
        let graph = PipelineGraph::parse(&text).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "checkpoint does not parse");
            WardenError::CorruptCheckpoint {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        if graph.meta().checkpoint_seq != Some(seq) {
            tracing::error!(path = %path.display(), "checkpoint sequence mismatch");
            return Err(WardenError::CorruptCheckpoint {
                path,
                reason: format!(
                    "records checkpoint_seq {:?}, expected {seq}",
                    graph.meta().checkpoint_seq
                ),
            });
        }
        Ok(graph)
    }

    pub fn latest(&self) -> Result<Option<PipelineGraph>> {
        match self.latest_seq()? {
            Some(seq) => self.load(seq).map(Some),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        self.sequences()?
            .into_iter()
            .map(|seq| {
                let graph = self.load(seq)?;
                Ok(CheckpointInfo {
                    seq,
                    revision: graph.revision(),
                    saved_at: graph.meta().checkpoint_at,
                    path: self.path_for(seq),
                })
            })
            .collect()
    }
}
