//! Durable run progress: the release marker and the per-file completion ledger.
//!
//! The marker is a two-line text file (`DATE_LAST_UPDATE`, then the token)
//! written only when a run completes every stage. The ledger is a JSON file
//! recording which archives of the current release are fully loaded, so a
//! rerun after a crash resumes instead of reloading. Archives whose load
//! started but did not finish are kept apart: their tables hold a prefix of
//! the file and must be recreated before that file is loaded again.
//!
//! Both files are replaced atomically: content goes to a sibling temp file
//! that is renamed over the target.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MARKER_HEADER: &str = "DATE_LAST_UPDATE";

/// Reads the stored marker. Any missing, unreadable or malformed file means
/// "never run".
pub fn read_marker(path: &Path) -> Option<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("No usable marker at {}: {}", path.display(), e);
            return None;
        }
    };

    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some(MARKER_HEADER) {
        warn!("Ignoring marker {} with unexpected header", path.display());
        return None;
    }
    lines
        .next()
        .map(|token| token.trim_end_matches('\r').to_string())
        .filter(|token| !token.is_empty())
}

pub fn write_marker(path: &Path, token: &str) -> Result<(), AppError> {
    write_atomic(path, format!("{}\n{}", MARKER_HEADER, token).as_bytes())
}

/// Completion record of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub loaded_at: DateTime<Utc>,
    pub table: String,
    pub rows: u64,
    /// SHA-256 of the decompressed content.
    pub sha256: String,
}

/// An archive whose load began and never completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialEntry {
    pub started_at: DateTime<Utc>,
    pub table: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Release token the entries belong to.
    pub release: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, LedgerEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partial: BTreeMap<String, PartialEntry>,
}

/// Owns the marker and ledger paths and the in-memory ledger.
#[derive(Debug)]
pub struct ProgressTracker {
    marker_path: PathBuf,
    ledger_path: PathBuf,
    ledger: Ledger,
}

impl ProgressTracker {
    /// Opens the tracker, reading an existing ledger. A ledger that exists but
    /// cannot be parsed is an error: guessing would either reload or skip files.
    pub fn open(marker_path: &Path, ledger_path: &Path) -> Result<Self, AppError> {
        let ledger = match std::fs::read(ledger_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ledger::default(),
            Err(e) => return Err(AppError::Io(e)),
        };

        Ok(Self {
            marker_path: marker_path.to_path_buf(),
            ledger_path: ledger_path.to_path_buf(),
            ledger,
        })
    }

    pub fn stored_marker(&self) -> Option<String> {
        read_marker(&self.marker_path)
    }

    /// Binds the ledger to `release`, discarding entries of any other release.
    pub fn begin_release(&mut self, release: &str) -> Result<(), AppError> {
        if self.ledger.release.as_deref() == Some(release) {
            if !self.ledger.files.is_empty() {
                info!(
                    "Resuming release {} with {} file(s) already loaded",
                    release,
                    self.ledger.files.len()
                );
            }
            return Ok(());
        }

        if self.ledger.release.is_some() {
            debug!(
                "Discarding ledger of release {:?}",
                self.ledger.release.as_deref()
            );
        }
        self.ledger = Ledger {
            release: Some(release.to_string()),
            ..Ledger::default()
        };
        self.save()
    }

    /// Exact-name membership test.
    pub fn is_uploaded(&self, name: &str) -> bool {
        self.ledger.files.contains_key(name)
    }

    /// Records that rows of `name` are about to reach `table`.
    pub fn mark_file_started(&mut self, name: &str, table: &str) -> Result<(), AppError> {
        self.ledger.partial.insert(
            name.to_string(),
            PartialEntry {
                started_at: Utc::now(),
                table: table.to_string(),
            },
        );
        self.save()
    }

    /// Drops the in-progress record of a load that stored nothing.
    pub fn forget_started(&mut self, name: &str) -> Result<(), AppError> {
        if self.ledger.partial.remove(name).is_some() {
            self.save()?;
        }
        Ok(())
    }

    pub fn mark_file_uploaded(&mut self, name: &str, entry: LedgerEntry) -> Result<(), AppError> {
        self.ledger.partial.remove(name);
        self.ledger.files.insert(name.to_string(), entry);
        self.save()
    }

    /// Archives left half-loaded in a table outside `recreated`, in name order.
    pub fn partial_outside(&self, recreated: &BTreeSet<String>) -> Vec<String> {
        self.ledger
            .partial
            .iter()
            .filter(|(_, entry)| !recreated.contains(&entry.table))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Forgets every file, loaded or partial, that targets one of `tables`.
    /// Used when those tables are recreated empty.
    pub fn forget_tables(&mut self, tables: &BTreeSet<String>) -> Result<(), AppError> {
        self.ledger
            .files
            .retain(|_, entry| !tables.contains(&entry.table));
        self.ledger
            .partial
            .retain(|_, entry| !tables.contains(&entry.table));
        self.save()
    }

    pub fn uploaded(&self) -> BTreeSet<String> {
        self.ledger.files.keys().cloned().collect()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Persists the marker. Called once, after every stage of the run succeeded.
    pub fn commit_marker(&self, token: &str) -> Result<(), AppError> {
        write_marker(&self.marker_path, token)?;
        info!("Progress marker advanced to {}", token);
        Ok(())
    }

    fn save(&self) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(&self.ledger)?;
        write_atomic(&self.ledger_path, &bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
