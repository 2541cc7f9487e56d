//! File-based signal channel.
//!
//! Every participant owns an inbox directory under a shared root:
//!
//! ```text
//! <root>/
//!   .tmp/                         staging area, never polled
//!   scheduler/
//!     20260301T101500.123456Z-1a2b3c4d-impl_complete.json
//!     processed/                  consumed signals, kept for history
//!   implementer/
//! ```
//!
//! Writers stage a complete file in `.tmp/` and rename it into the target
//! inbox, so a reader sees a whole signal or none. Readers take files in name
//! order (the name starts with a sortable UTC timestamp), parse them, and then
//! claim them by renaming into `processed/`. The rename is the claim: when two
//! readers race on one file, only one rename succeeds.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_types::{fs::write_atomic_in, Result, WardenError};

const STAGING_DIR: &str = ".tmp";
const PROCESSED_DIR: &str = "processed";
const EXTENSION: &str = "json";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("participant name pattern compiles")
    })
}

/// Participant and signal-type names become path components; keep them tame.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name_pattern().is_match(name) && name != PROCESSED_DIR {
        Ok(())
    } else {
        Err(WardenError::InvalidAttribute {
            owner: "signal".into(),
            key: kind.into(),
            message: format!("'{name}' is not a valid {kind} name"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// File stem: `<timestamp>-<8 hex>-<signal_type>`.
    pub id: String,
    pub source: String,
    pub target: String,
    pub signal_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Signal {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        signal_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let timestamp = Utc::now();
        let signal_type = signal_type.into();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let id = format!(
            "{}-{}-{}",
            timestamp.format("%Y%m%dT%H%M%S%.6fZ"),
            &nonce[..8],
            signal_type
        );
        Self {
            id,
            source: source.into(),
            target: target.into(),
            signal_type,
            timestamp,
            payload,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{EXTENSION}", self.id)
    }
}

/// Handle on the shared signal root.
#[derive(Debug, Clone)]
pub struct SignalChannel {
    root: PathBuf,
}

impl SignalChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Build and deliver a signal. Returns the delivered file's path.
    pub fn send(
        &self,
        source: &str,
        target: &str,
        signal_type: &str,
        payload: Value,
    ) -> Result<PathBuf> {
        self.deliver(&Signal::new(source, target, signal_type, payload))
    }

    /// Atomically place `signal` in its target's inbox.
    pub fn deliver(&self, signal: &Signal) -> Result<PathBuf> {
        validate_name("participant", &signal.source)?;
        validate_name("participant", &signal.target)?;
        validate_name("signal type", &signal.signal_type)?;
        validate_name("signal id", &signal.id)?;

        let inbox = self.inbox(&signal.target)?;
        let dest = inbox.dir().join(signal.file_name());
        let body = serde_json::to_vec_pretty(signal)?;
        write_atomic_in(&self.staging_dir(), &dest, &body)?;

        tracing::debug!(
            id = %signal.id,
            source = %signal.source,
            target = %signal.target,
            signal_type = %signal.signal_type,
            "signal delivered"
        );
        Ok(dest)
    }

    pub fn inbox(&self, participant: &str) -> Result<Inbox> {
        validate_name("participant", participant)?;
        let dir = self.root.join(participant);
        fs::create_dir_all(dir.join(PROCESSED_DIR))?;
        Ok(Inbox { dir })
    }

    /// Names of every participant that has an inbox.
    pub fn participants(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && name != STAGING_DIR {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// A signal taken from an inbox, with where it was archived.
#[derive(Debug, Clone)]
pub struct Received {
    pub signal: Signal,
    pub archived_at: PathBuf,
}

/// Outcome of one pass over an inbox.
#[derive(Debug, Default)]
pub struct InboxBatch {
    pub received: Vec<Received>,
    /// Files that could not be parsed. They stay in the inbox for an operator.
    pub corrupt: Vec<WardenError>,
}

#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.dir.join(PROCESSED_DIR)
    }

    /// Unconsumed signal files, oldest first.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        list_signal_files(&self.dir)
    }

    /// Consumed signal files, oldest first.
    pub fn processed(&self) -> Result<Vec<PathBuf>> {
        list_signal_files(&self.processed_dir())
    }

    /// Parse a signal file without claiming it.
    pub fn read(&self, path: &Path) -> Result<Signal> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| WardenError::CorruptSignal {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Move a pending file into `processed/`. `None` means another reader got it first.
    pub fn claim(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(name) = path.file_name() else {
            return Err(WardenError::Other(format!(
                "signal path has no file name: {}",
                path.display()
            )));
        };
        let dest = self.processed_dir().join(name);
        match fs::rename(path, &dest) {
            Ok(()) => Ok(Some(dest)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse and claim every pending signal in order.
    pub fn receive(&self) -> Result<InboxBatch> {
        let mut received = Vec::new();
        let corrupt = self.drain(|r| {
            received.push(r);
            Ok(())
        })?;
        Ok(InboxBatch { received, corrupt })
    }

    /// Parse, claim and hand over pending signals one at a time, oldest first.
    ///
    /// A file is claimed only when its turn comes, so if `handle` fails the
    /// drain stops and every later file stays pending. Returns the files that
    /// could not be parsed.
    pub fn drain<F>(&self, mut handle: F) -> Result<Vec<WardenError>>
    where
        F: FnMut(Received) -> Result<()>,
    {
        let mut corrupt = Vec::new();
        for path in self.pending()? {
            let signal = match self.read(&path) {
                Ok(signal) => signal,
                Err(e @ WardenError::CorruptSignal { .. }) => {
                    tracing::error!(path = %path.display(), error = %e, "corrupt signal left in inbox");
                    corrupt.push(e);
                    continue;
                }
                // Vanished between listing and reading: another reader claimed it.
                Err(WardenError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if let Some(archived_at) = self.claim(&path)? {
                tracing::debug!(id = %signal.id, signal_type = %signal.signal_type, "signal consumed");
                handle(Received { signal, archived_at })?;
            }
        }
        Ok(corrupt)
    }
}

fn list_signal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden
            && entry.file_type()?.is_file()
            && path.extension().is_some_and(|ext| ext == EXTENSION)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
