use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use warden_types::lock::{lock_path_for, FileLock};
use warden_types::retry::BackoffPolicy;
use warden_types::{Result, WardenError};

use crate::entry::{AuditEntry, GENESIS_HASH};

/// Action recorded when a partially written trailing line is discarded.
pub const TORN_TAIL_ACTION: &str = "audit.torn_tail_recovered";

const READ_BLOCK: u64 = 8192;

/// Result of a successful [`AuditLog::verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub entries: u64,
    pub head_hash: String,
}

/// Read-only digest of a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSummary {
    pub entries: u64,
    pub head_hash: String,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub by_action: BTreeMap<String, u64>,
    pub by_actor: BTreeMap<String, u64>,
}

/// A single append-only, hash-chained JSON-lines file.
///
/// Appends are serialized across processes by an exclusive lock on a sidecar
/// `<file>.lock`, and each append re-reads the current head under that lock,
/// so two writers can never link to the same predecessor. A crash mid-append
/// leaves at most one partial trailing line; the next append truncates it,
/// records the truncation, and continues from the last complete entry.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    lock_path: PathBuf,
    lock_attempts: usize,
    lock_policy: BackoffPolicy,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            lock_path: lock_path_for(&path),
            path,
            lock_attempts: 20,
            lock_policy: BackoffPolicy::default(),
        })
    }

    /// Override how long an append waits for a contended lock.
    pub fn with_lock_retry(mut self, attempts: usize, policy: BackoffPolicy) -> Self {
        self.lock_attempts = attempts;
        self.lock_policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry and return its `entry_hash`.
    pub fn append(&self, actor: &str, action: &str, payload: Value) -> Result<String> {
        self.append_entry(actor, action, payload)
            .map(|entry| entry.entry_hash)
    }

    /// Append an entry and return it in full.
    pub fn append_entry(&self, actor: &str, action: &str, payload: Value) -> Result<AuditEntry> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_attempts, &self.lock_policy)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        let torn = truncate_torn_tail(&mut file)?;
        let mut head = self.read_head(&mut file)?;
        if let Some(discarded) = torn {
            tracing::warn!(
                path = %self.path.display(),
                discarded_bytes = discarded,
                "discarded partially written audit entry"
            );
            let recovered = self.write_next(
                &mut file,
                head.as_ref(),
                "audit",
                TORN_TAIL_ACTION,
                json!({ "discarded_bytes": discarded }),
            )?;
            head = Some(recovered);
        }

        self.write_next(&mut file, head.as_ref(), actor, action, payload)
    }

    fn write_next(
        &self,
        file: &mut File,
        head: Option<&AuditEntry>,
        actor: &str,
        action: &str,
        payload: Value,
    ) -> Result<AuditEntry> {
        let (sequence_no, prev_hash) = match head {
            Some(h) => (h.sequence_no + 1, h.entry_hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        let entry = AuditEntry::seal(sequence_no, prev_hash, actor, action, payload, Utc::now());

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;

        tracing::debug!(
            seq = entry.sequence_no,
            entry_hash = %entry.entry_hash,
            actor = %entry.actor,
            action = %entry.action,
            "audit entry appended"
        );
        Ok(entry)
    }

    /// Last complete entry, read backwards from the end of the file.
    fn read_head(&self, file: &mut File) -> Result<Option<AuditEntry>> {
        let len = file.seek(SeekFrom::End(0))?;
        let Some(last_nl) = last_newline_before(file, len)? else {
            return Ok(None);
        };
        let start = match last_newline_before(file, last_nl)? {
            Some(pos) => pos + 1,
            None => 0,
        };
        let mut line = vec![0u8; (last_nl - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut line)?;

        match serde_json::from_slice::<AuditEntry>(&line) {
            Ok(entry) => Ok(Some(entry)),
            // Rescan so the error names the exact index.
            Err(_) => self.entries().map(|all| all.into_iter().last()),
        }
    }

    /// Every complete entry, in order. A partial trailing line is ignored.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut raw = Vec::new();

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            if raw.last() != Some(&b'\n') {
                tracing::debug!(path = %self.path.display(), "ignoring partial trailing audit line");
                break;
            }
            let index = entries.len() as u64;
            let entry = serde_json::from_slice::<AuditEntry>(&raw[..raw.len() - 1]).map_err(|e| {
                tracing::error!(path = %self.path.display(), index, error = %e, "unreadable audit entry");
                WardenError::ChainBroken {
                    index,
                    reason: format!("unreadable entry: {e}"),
                }
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Walk the whole chain, failing on the first entry whose sequence number,
    /// link or hash does not check out.
    pub fn verify_chain(&self) -> Result<ChainVerification> {
        let entries = self.entries()?;
        let mut expected_prev = GENESIS_HASH.to_string();

        for (i, entry) in entries.iter().enumerate() {
            let index = i as u64;
            let reason = if entry.sequence_no != index {
                Some(format!("sequence_no {} where {index} was expected", entry.sequence_no))
            } else if entry.prev_hash != expected_prev {
                Some("prev_hash does not link to the previous entry".to_string())
            } else if entry.compute_hash() != entry.entry_hash {
                Some("entry_hash does not match entry contents".to_string())
            } else {
                None
            };

            if let Some(reason) = reason {
                tracing::error!(path = %self.path.display(), index, %reason, "audit chain broken");
                return Err(WardenError::ChainBroken { index, reason });
            }
            expected_prev = entry.entry_hash.clone();
        }

        tracing::debug!(entries = entries.len(), head = %expected_prev, "audit chain verified");
        Ok(ChainVerification {
            entries: entries.len() as u64,
            head_hash: expected_prev,
        })
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.entries()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }

    pub fn summarize(&self) -> Result<AuditSummary> {
        let entries = self.entries()?;
        let mut by_action = BTreeMap::new();
        let mut by_actor = BTreeMap::new();
        for entry in &entries {
            *by_action.entry(entry.action.clone()).or_insert(0) += 1;
            *by_actor.entry(entry.actor.clone()).or_insert(0) += 1;
        }
        Ok(AuditSummary {
            entries: entries.len() as u64,
            head_hash: entries
                .last()
                .map(|e| e.entry_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            first_timestamp: entries.first().map(|e| e.timestamp.clone()),
            last_timestamp: entries.last().map(|e| e.timestamp.clone()),
            by_action,
            by_actor,
        })
    }
}

/// Position of the last `\n` strictly before `end`.
fn last_newline_before(file: &mut File, end: u64) -> std::io::Result<Option<u64>> {
    let mut buf = vec![0u8; READ_BLOCK as usize];
    let mut hi = end;
    while hi > 0 {
        let lo = hi.saturating_sub(READ_BLOCK);
        let len = (hi - lo) as usize;
        file.seek(SeekFrom::Start(lo))?;
        file.read_exact(&mut buf[..len])?;
        if let Some(i) = buf[..len].iter().rposition(|b| *b == b'\n') {
            return Ok(Some(lo + i as u64));
        }
        hi = lo;
    }
    Ok(None)
}

/// Truncate bytes after the last newline. Returns how many were dropped.
fn truncate_torn_tail(file: &mut File) -> std::io::Result<Option<u64>> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(None);
    }
    let keep = match last_newline_before(file, len)? {
        Some(pos) if pos + 1 == len => return Ok(None),
        Some(pos) => pos + 1,
        None => 0,
    };
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(Some(len - keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn log_in(dir: &tempfile::TempDir) -> AuditLog {
        AuditLog::open(dir.path().join("audit/p.jsonl")).unwrap()
    }

    fn rewrite_line(path: &Path, index: usize, f: impl FnOnce(&str) -> String) {
        let text = fs::read_to_string(path).unwrap();
        let mut lines: Vec<String> = text.lines().map(String::from).collect();
        lines[index] = f(&lines[index]);
        fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn empty_log_verifies_with_genesis_head() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        let report = log.verify_chain().unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(report.head_hash, GENESIS_HASH);
    }

    #[test]
    fn append_links_entries_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);

        let h0 = log.append("scheduler", "node.transition", json!({"node": "a"})).unwrap();
        let h1 = log.append("worker-1", "guard.evaluate", json!({"node": "a", "allowed": true})).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[0].entry_hash, h0);
        assert_eq!(entries[1].prev_hash, h0);
        assert_eq!(entries[1].sequence_no, 1);

        let report = log.verify_chain().unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.head_hash, h1);
    }

    #[test]
    fn reopened_log_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let h0 = log_in(&dir).append("a", "x", json!({})).unwrap();

        let reopened = log_in(&dir);
        reopened.append("a", "y", json!({})).unwrap();
        let entries = reopened.entries().unwrap();
        assert_eq!(entries[1].prev_hash, h0);
        assert!(reopened.verify_chain().is_ok());
    }

    #[test]
    fn tampered_payload_fails_at_that_index() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        for i in 0..5 {
            log.append("s", "step", json!({"n": i, "note": "ok"})).unwrap();
        }

        rewrite_line(log.path(), 2, |line| line.replace("\"ok\"", "\"OK\""));

        match log.verify_chain().unwrap_err() {
            WardenError::ChainBroken { index, reason } => {
                assert_eq!(index, 2);
                assert!(reason.contains("entry_hash"), "{reason}");
            }
            other => panic!("expected ChainBroken, got {other:?}"),
        }
    }

    #[test]
    fn deleted_entry_fails_at_gap() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        for i in 0..4 {
            log.append("s", "step", json!({"n": i})).unwrap();
        }
        let text = fs::read_to_string(log.path()).unwrap();
        let kept: Vec<&str> = text.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(log.path(), kept.join("\n") + "\n").unwrap();

        match log.verify_chain().unwrap_err() {
            WardenError::ChainBroken { index, .. } => assert_eq!(index, 1),
            other => panic!("expected ChainBroken, got {other:?}"),
        }
    }

    #[test]
    fn garbage_line_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        log.append("s", "a", json!({})).unwrap();
        log.append("s", "b", json!({})).unwrap();
        rewrite_line(log.path(), 1, |_| "{not json".to_string());

        let err = log.verify_chain().unwrap_err();
        assert!(err.is_integrity());
        assert!(matches!(err, WardenError::ChainBroken { index: 1, .. }));
    }

    #[test]
    fn torn_tail_is_truncated_and_chain_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        log.append("s", "a", json!({})).unwrap();
        let h1 = log.append("s", "b", json!({})).unwrap();

        // simulate a crash halfway through writing the third line
        let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
        f.write_all(br#"{"sequence_no":2,"prev_hash":"ab"#).unwrap();
        drop(f);

        // readers ignore the fragment
        assert_eq!(log.entries().unwrap().len(), 2);

        let restarted = log_in(&dir);
        restarted.append("s", "c", json!({})).unwrap();

        let entries = restarted.entries().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].action, TORN_TAIL_ACTION);
        assert_eq!(entries[2].prev_hash, h1);
        assert_eq!(entries[2].payload["discarded_bytes"], 32);
        assert_eq!(entries[3].action, "c");
        assert_eq!(restarted.verify_chain().unwrap().entries, 4);
    }

    #[test]
    fn concurrent_appends_serialize_into_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("audit/p.jsonl"));

        let handles: Vec<_> = (0..2)
            .map(|t| {
                let path = Arc::clone(&path);
                std::thread::spawn(move || {
                    let log = AuditLog::open(path.as_ref().clone())
                        .unwrap()
                        .with_lock_retry(500, BackoffPolicy::Fixed(Duration::from_millis(2)));
                    for i in 0..20 {
                        log.append(&format!("writer-{t}"), "step", json!({ "i": i })).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let log = AuditLog::open(path.as_ref().clone()).unwrap();
        let report = log.verify_chain().unwrap();
        assert_eq!(report.entries, 40);
        let summary = log.summarize().unwrap();
        assert_eq!(summary.by_actor["writer-0"], 20);
        assert_eq!(summary.by_actor["writer-1"], 20);
    }

    #[test]
    fn tail_returns_most_recent_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        for i in 0..5 {
            log.append("s", &format!("a{i}"), json!({})).unwrap();
        }
        let tail: Vec<_> = log.tail(2).unwrap().into_iter().map(|e| e.action).collect();
        assert_eq!(tail, vec!["a3", "a4"]);
        assert_eq!(log.tail(50).unwrap().len(), 5);
    }

    #[test]
    fn summarize_counts_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        log.append("scheduler", "node.transition", json!({})).unwrap();
        log.append("scheduler", "guard.evaluate", json!({})).unwrap();
        let last = log.append("v-1", "node.transition", json!({})).unwrap();

        let summary = log.summarize().unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.head_hash, last);
        assert_eq!(summary.by_action["node.transition"], 2);
        assert_eq!(summary.by_actor["scheduler"], 2);
        assert!(summary.first_timestamp.unwrap() <= summary.last_timestamp.unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn any_single_payload_byte_change_is_detected(
            notes in proptest::collection::vec("[a-z]{4,12}", 1..6),
            pick in any::<prop::sample::Index>(),
            offset in any::<prop::sample::Index>(),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let log = log_in(&dir);
            for note in &notes {
                log.append("s", "step", json!({ "note": note })).unwrap();
            }
            prop_assert!(log.verify_chain().is_ok());

            let target = pick.index(notes.len());
            let note = &notes[target];
            let at = offset.index(note.len());
            let mut mutated = note.clone().into_bytes();
            mutated[at] = if mutated[at] == b'Z' { b'Y' } else { b'Z' };
            let mutated = String::from_utf8(mutated).unwrap();

            let needle = format!("\"note\":\"{note}\"");
            let replacement = format!("\"note\":\"{mutated}\"");
            rewrite_line(log.path(), target, |line| line.replacen(&needle, &replacement, 1));

            match log.verify_chain() {
                Err(WardenError::ChainBroken { index, .. }) => prop_assert_eq!(index, target as u64),
                other => prop_assert!(false, "expected ChainBroken, got {:?}", other),
            }
        }
    }
}
