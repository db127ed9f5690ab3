//! Release change detection and run bookkeeping.
//!
//! This module holds the pure decision logic and the result types of a run,
//! decoupled from the I/O performed by the pipeline.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Returns true when a run should proceed.
///
/// The publisher timestamp is an opaque token: the run is skipped only when
/// the stored marker is exactly equal to it. A missing marker always runs.
///
/// # Examples
///
/// ```
/// use receita_core::sync::should_run;
///
/// assert!(!should_run("12/03/2024", Some("12/03/2024")));
/// assert!(should_run("12/03/2024", Some("10/02/2024")));
/// assert!(should_run("12/03/2024", None));
/// ```
pub fn should_run(current: &str, stored: Option<&str>) -> bool {
    stored != Some(current)
}

/// Result of change detection for a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDecision {
    pub proceed: bool,
    /// Human-readable reason for the decision
    pub reason: &'static str,
}

/// Change detection with an operator override.
pub fn decide_run(current: &str, stored: Option<&str>, force: bool) -> RunDecision {
    match stored {
        _ if force => RunDecision {
            proceed: true,
            reason: "forced by operator",
        },
        None => RunDecision {
            proceed: true,
            reason: "no stored marker",
        },
        Some(marker) if marker == current => RunDecision {
            proceed: false,
            reason: "release unchanged",
        },
        Some(_) => RunDecision {
            proceed: true,
            reason: "release changed",
        },
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Idle,
    Checking,
    Fetching,
    Loading,
    Indexing,
    Done,
    Skipped,
}

impl RunState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Checking)
                | (Checking, Skipped)
                | (Checking, Fetching)
                | (Fetching, Loading)
                | (Loading, Fetching)
                | (Fetching, Indexing)
                | (Loading, Indexing)
                | (Fetching, Done)
                | (Loading, Done)
                | (Indexing, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Skipped)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "IDLE",
            RunState::Checking => "CHECKING",
            RunState::Fetching => "FETCHING",
            RunState::Loading => "LOADING",
            RunState::Indexing => "INDEXING",
            RunState::Done => "DONE",
            RunState::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// Outcome of processing a single archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    /// Every batch was inserted
    Loaded,
    /// Fetched only; the load stage was disabled
    Downloaded,
    /// Already in the completion ledger for this release
    AlreadyLoaded,
    UnknownLayout,
    UnpackFailed,
    FetchFailed,
    /// Not started because the run was halting
    Aborted,
}

impl FileOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FileOutcome::Loaded => "loaded",
            FileOutcome::Downloaded => "downloaded",
            FileOutcome::AlreadyLoaded => "already_loaded",
            FileOutcome::UnknownLayout => "unknown_layout",
            FileOutcome::UnpackFailed => "unpack_failed",
            FileOutcome::FetchFailed => "fetch_failed",
            FileOutcome::Aborted => "aborted",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            FileOutcome::UnknownLayout | FileOutcome::UnpackFailed | FileOutcome::FetchFailed
        )
    }
}

/// What happened to one archive during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub name: String,
    pub table: Option<String>,
    pub outcome: FileOutcome,
    pub rows: u64,
    pub batches: u64,
    /// Malformed date values stored as null.
    pub dates_coerced: u64,
    pub error: Option<String>,
}

impl FileReport {
    pub fn new(name: &str, outcome: FileOutcome) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            outcome,
            rows: 0,
            batches: 0,
            dates_coerced: 0,
            error: None,
        }
    }

    pub fn failed(name: &str, outcome: FileOutcome, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(name, outcome)
        }
    }
}

/// Counters over the file reports of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub loaded: usize,
    pub downloaded: usize,
    pub already_loaded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub rows: u64,
    pub dates_coerced: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a report, incrementing the appropriate counters.
    pub fn record(&mut self, report: &FileReport) {
        match report.outcome {
            FileOutcome::Loaded => self.loaded += 1,
            FileOutcome::Downloaded => self.downloaded += 1,
            FileOutcome::AlreadyLoaded => self.already_loaded += 1,
            FileOutcome::Aborted => self.aborted += 1,
            FileOutcome::UnknownLayout | FileOutcome::UnpackFailed | FileOutcome::FetchFailed => {
                self.failed += 1
            }
        }
        self.rows += report.rows;
        self.dates_coerced += report.dates_coerced;
    }

    /// Returns the total number of processed files.
    pub fn total(&self) -> usize {
        self.loaded + self.downloaded + self.already_loaded + self.failed + self.aborted
    }
}

/// Final result of a run that did not fail.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub release: String,
    pub reason: &'static str,
    pub reports: Vec<FileReport>,
    pub marker_committed: bool,
    /// Files recorded in the completion ledger for this release.
    pub uploaded: BTreeSet<String>,
}

impl RunSummary {
    pub fn skipped(release: String, reason: &'static str) -> Self {
        Self {
            state: RunState::Skipped,
            release,
            reason,
            reports: Vec::new(),
            marker_committed: false,
            uploaded: BTreeSet::new(),
        }
    }

    pub fn stats(&self) -> RunStats {
        let mut stats = RunStats::new();
        for report in &self.reports {
            stats.record(report);
        }
        stats
    }

    pub fn report(&self, name: &str) -> Option<&FileReport> {
        self.reports.iter().find(|r| r.name == name)
    }

    /// Reports of files that were skipped because of a per-file failure.
    pub fn failures(&self) -> impl Iterator<Item = &FileReport> {
        self.reports.iter().filter(|r| r.outcome.is_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_run_equal_tokens() {
        for token in ["01/01/1900", "2024-05-12", "", "x"] {
            assert!(!should_run(token, Some(token)));
        }
    }

    #[test]
    fn test_should_run_different_tokens() {
        assert!(should_run("12/03/2024", Some("12/03/2023")));
        // Opaque comparison: an "older" token still triggers a run.
        assert!(should_run("01/01/2020", Some("12/03/2024")));
        assert!(should_run("12/03/2024", Some("12/03/2024 ")));
    }

    #[test]
    fn test_should_run_missing_marker() {
        assert!(should_run("12/03/2024", None));
    }

    #[test]
    fn test_decide_run_reasons() {
        assert_eq!(decide_run("a", Some("a"), false).reason, "release unchanged");
        assert!(!decide_run("a", Some("a"), false).proceed);
        assert_eq!(decide_run("a", Some("b"), false).reason, "release changed");
        assert_eq!(decide_run("a", None, false).reason, "no stored marker");
        let forced = decide_run("a", Some("a"), true);
        assert!(forced.proceed);
        assert_eq!(forced.reason, "forced by operator");
    }

    #[test]
    fn test_run_state_transitions() {
        assert!(RunState::Idle.can_advance_to(RunState::Checking));
        assert!(RunState::Checking.can_advance_to(RunState::Skipped));
        assert!(RunState::Loading.can_advance_to(RunState::Indexing));
        assert!(RunState::Indexing.can_advance_to(RunState::Done));
        assert!(!RunState::Idle.can_advance_to(RunState::Loading));
        assert!(!RunState::Skipped.can_advance_to(RunState::Fetching));
        assert!(!RunState::Done.can_advance_to(RunState::Checking));
        assert!(RunState::Done.is_terminal());
        assert!(!RunState::Loading.is_terminal());
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Skipped.to_string(), "SKIPPED");
        assert_eq!(RunState::Indexing.to_string(), "INDEXING");
    }

    #[test]
    fn test_run_stats_record() {
        let mut stats = RunStats::new();
        let mut loaded = FileReport::new("Empresas0.zip", FileOutcome::Loaded);
        loaded.rows = 10;
        loaded.dates_coerced = 2;
        stats.record(&loaded);
        stats.record(&FileReport::failed(
            "Unknown.zip",
            FileOutcome::UnknownLayout,
            "no layout".into(),
        ));
        stats.record(&FileReport::new("Cnaes.zip", FileOutcome::AlreadyLoaded));

        assert_eq!(stats.loaded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.already_loaded, 1);
        assert_eq!(stats.rows, 10);
        assert_eq!(stats.dates_coerced, 2);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_summary_failures() {
        let summary = RunSummary {
            state: RunState::Done,
            release: "r".into(),
            reason: "release changed",
            reports: vec![
                FileReport::new("a.zip", FileOutcome::Loaded),
                FileReport::failed("b.zip", FileOutcome::FetchFailed, "timeout".into()),
            ],
            marker_committed: true,
            uploaded: BTreeSet::new(),
        };
        let failed: Vec<&str> = summary.failures().map(|r| r.name.as_str()).collect();
        assert_eq!(failed, vec!["b.zip"]);
        assert_eq!(summary.report("a.zip").unwrap().outcome, FileOutcome::Loaded);
    }

    #[test]
    fn test_skipped_summary() {
        let summary = RunSummary::skipped("12/03/2024".into(), "release unchanged");
        assert_eq!(summary.state, RunState::Skipped);
        assert!(!summary.marker_committed);
        assert_eq!(summary.stats().total(), 0);
    }
}
