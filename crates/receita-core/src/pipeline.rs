//! The daily routine: change detection, fetch, unpack, load, index, commit.

use crate::archive;
use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::layout::LayoutRegistry;
use crate::loader::{BatchLoader, LoadStats, TableStore};
use crate::models::{FileEntry, Release};
use crate::progress::{LedgerEntry, ProgressTracker};
use crate::sync::{decide_run, FileOutcome, FileReport, RunDecision, RunState, RunSummary};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where releases come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Reads the current release. Fails with `CatalogUnavailable`.
    async fn fetch_release(&self) -> Result<Release, AppError>;

    /// Downloads one archive to `destination`. Fails with `FetchFailed` and
    /// leaves nothing at `destination` in that case.
    async fn fetch_file(&self, entry: &FileEntry, destination: &Path) -> Result<(), AppError>;
}

/// Stages enabled for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub download: bool,
    pub upload: bool,
    /// Create the lookup indexes after loading.
    pub index_base: bool,
    /// Recreate every target table and forget loaded files before loading.
    pub first_upload_truncate: bool,
    /// Run even if the stored marker matches the release.
    pub force: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            download: true,
            upload: true,
            index_base: false,
            first_upload_truncate: false,
            force: false,
        }
    }
}

/// Ingests a release from `R` into `S`.
pub struct Pipeline<R, S> {
    source: R,
    store: S,
    registry: Arc<LayoutRegistry>,
    config: PipelineConfig,
    loader: BatchLoader,
    cancel: CancellationToken,
}

impl<R: ReleaseSource, S: TableStore> Pipeline<R, S> {
    pub fn new(source: R, store: S, registry: Arc<LayoutRegistry>, config: PipelineConfig) -> Self {
        let loader = BatchLoader::new(&config);
        Self {
            source,
            store,
            registry,
            config,
            loader,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to abort the run between files and batches.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &LayoutRegistry {
        &self.registry
    }

    /// Runs the routine once.
    ///
    /// Returns a `Skipped` summary when the release is unchanged and a `Done`
    /// summary when every file was processed. The marker is committed at that
    /// point unless the load stage was disabled.
    ///
    /// Per-file failures are reported in the summary. Any other error aborts
    /// the run and leaves the marker untouched; files loaded before the error
    /// stay loaded and recorded in the ledger.
    ///
    /// A file that failed after some of its batches were stored is refused by
    /// later runs with `PartialLoad` until its table is recreated.
    pub async fn run(&self, options: RunOptions) -> Result<RunSummary, AppError> {
        self.run_selected(options, &[]).await
    }

    /// Runs the routine on the archives named in `only`, matched against the
    /// catalog ignoring ASCII case. An empty `only` means the whole release.
    ///
    /// A selection always runs, whatever the stored marker says, and never
    /// commits the marker since the rest of the release was not processed.
    /// With `first_upload_truncate`, only the tables of the selected archives
    /// are recreated.
    pub async fn run_selected(
        &self,
        options: RunOptions,
        only: &[String],
    ) -> Result<RunSummary, AppError> {
        let mut state = RunState::Idle;
        advance(&mut state, RunState::Checking);

        let release = self.source.fetch_release().await?;
        let entries = select_entries(&release, only)?;
        let mut tracker = ProgressTracker::open(&self.config.marker_path, &self.config.ledger_path)?;
        let stored = tracker.stored_marker();
        let decision = if only.is_empty() {
            decide_run(&release.last_update, stored.as_deref(), options.force)
        } else {
            RunDecision {
                proceed: true,
                reason: "archives selected by operator",
            }
        };

        if !decision.proceed {
            info!(
                "Release {} already ingested ({}), skipping",
                release.last_update, decision.reason
            );
            advance(&mut state, RunState::Skipped);
            return Ok(RunSummary::skipped(release.last_update, decision.reason));
        }

        info!(
            "Ingesting release {} ({}): {} archive(s)",
            release.last_update,
            decision.reason,
            entries.len()
        );
        tracker.begin_release(&release.last_update)?;

        if options.upload {
            self.prepare_tables(&mut tracker, &entries, options.first_upload_truncate)
                .await?;
        }

        advance(&mut state, RunState::Fetching);
        if options.download {
            tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        }

        let tracker = Mutex::new(tracker);
        let halt = self.cancel.child_token();
        let total = entries.len();

        let mut results: Vec<(usize, Result<FileReport, AppError>)> =
            stream::iter(entries.iter().enumerate())
                .map(|(i, entry)| {
                    let tracker = &tracker;
                    let halt = &halt;
                    async move {
                        let result = self.process_file(entry, options, tracker, halt).await;
                        if let Ok(report) = &result {
                            debug!("[{}/{}] {}: {:?}", i + 1, total, entry.name, report.outcome);
                        }
                        (i, result)
                    }
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(i, _)| *i);

        let mut reports = Vec::with_capacity(total);
        let mut fatal: Option<AppError> = None;
        for (_, result) in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    let replace = match &fatal {
                        None => true,
                        Some(AppError::Cancelled) => !matches!(e, AppError::Cancelled),
                        Some(_) => false,
                    };
                    if replace {
                        fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            error!("Run aborted, marker not advanced: {}", e);
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            warn!("Run cancelled, marker not advanced");
            return Err(AppError::Cancelled);
        }
        if options.upload {
            advance(&mut state, RunState::Loading);
        }

        if options.index_base && options.upload {
            advance(&mut state, RunState::Indexing);
            self.build_indexes().await?;
        }

        // A download-only run has not ingested anything yet, and a selection
        // has not covered the release.
        let tracker = tracker.into_inner();
        let commit = options.upload && only.is_empty();
        if commit {
            tracker.commit_marker(&release.last_update)?;
        }
        advance(&mut state, RunState::Done);

        let summary = RunSummary {
            state,
            release: release.last_update,
            reason: decision.reason,
            reports,
            marker_committed: commit,
            uploaded: tracker.uploaded(),
        };
        let stats = summary.stats();
        info!(
            "Run complete: {} loaded, {} downloaded, {} already loaded, {} failed ({} rows)",
            stats.loaded, stats.downloaded, stats.already_loaded, stats.failed, stats.rows
        );
        Ok(summary)
    }

    /// Creates every index of the registry. Safe to repeat.
    pub async fn build_indexes(&self) -> Result<(), AppError> {
        let indexes = self.registry.indexes();
        info!("Creating {} index(es)", indexes.len());
        for index in indexes {
            self.store
                .create_indexes(std::slice::from_ref(index))
                .await
                .map_err(|cause| AppError::StoreFailed {
                    operation: "create index",
                    table: index.table.clone(),
                    cause,
                })?;
            debug!("Index {} ready on {}.{}", index.name, index.table, index.column);
        }
        Ok(())
    }

    /// Refuses to load on top of a partial load, then recreates the target
    /// tables when truncating. Runs to completion before any file is loaded.
    async fn prepare_tables(
        &self,
        tracker: &mut ProgressTracker,
        entries: &[FileEntry],
        truncate: bool,
    ) -> Result<(), AppError> {
        let recreated: BTreeSet<String> = if truncate {
            self.registry
                .layouts_for(entries)
                .into_iter()
                .map(|layout| layout.table.clone())
                .collect()
        } else {
            BTreeSet::new()
        };

        let stale = tracker.partial_outside(&recreated);
        if !stale.is_empty() {
            error!(
                "{} partially loaded by an earlier run, refusing to load on top of it",
                stale.join(", ")
            );
            return Err(AppError::PartialLoad { files: stale });
        }

        if truncate {
            self.recreate_tables(entries).await?;
            tracker.forget_tables(&recreated)?;
        }
        Ok(())
    }

    /// Drops and recreates the table of every layout the entries target.
    async fn recreate_tables(&self, entries: &[FileEntry]) -> Result<(), AppError> {
        for layout in self.registry.layouts_for(entries) {
            info!("Recreating table {}", layout.table);
            self.store
                .recreate_table(layout)
                .await
                .map_err(|cause| AppError::StoreFailed {
                    operation: "recreate table",
                    table: layout.table.clone(),
                    cause,
                })?;
        }
        Ok(())
    }

    /// Takes one archive through fetch, unpack and load.
    ///
    /// Per-file failures come back as reports. An `Err` is fatal to the run
    /// and trips `halt` so no further file starts.
    async fn process_file(
        &self,
        entry: &FileEntry,
        options: RunOptions,
        tracker: &Mutex<ProgressTracker>,
        halt: &CancellationToken,
    ) -> Result<FileReport, AppError> {
        if halt.is_cancelled() {
            return Ok(FileReport::new(&entry.name, FileOutcome::Aborted));
        }

        if tracker.lock().await.is_uploaded(&entry.name) {
            info!("{} already loaded for this release, skipping", entry.name);
            return Ok(FileReport::new(&entry.name, FileOutcome::AlreadyLoaded));
        }

        if options.upload {
            if let Err(e) = self.registry.resolve(entry) {
                warn!("Skipping {}: {}", entry.name, e);
                return Ok(FileReport::failed(
                    &entry.name,
                    FileOutcome::UnknownLayout,
                    e.to_string(),
                ));
            }
        }

        let archive_path = self.config.staging_dir.join(&entry.name);
        if options.download {
            if let Err(e) = self.fetch_archive(entry, &archive_path).await {
                warn!("Skipping {}: {}", entry.name, e);
                return Ok(FileReport::failed(
                    &entry.name,
                    FileOutcome::FetchFailed,
                    e.to_string(),
                ));
            }
        }

        if !options.upload {
            return Ok(FileReport::new(&entry.name, FileOutcome::Downloaded));
        }

        let resolved = {
            let entry = entry.clone();
            let registry = Arc::clone(&self.registry);
            let staging_dir = self.config.staging_dir.clone();
            tokio::task::spawn_blocking(move || {
                archive::resolve(&entry, &registry, &staging_dir)
            })
            .await
            .map_err(|e| AppError::Generic(format!("unpack task failed: {}", e)))?
        };
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) if e.is_per_file() => {
                warn!("Skipping {}: {}", entry.name, e);
                let outcome = match e {
                    AppError::UnknownLayout { .. } => FileOutcome::UnknownLayout,
                    _ => FileOutcome::UnpackFailed,
                };
                return Ok(FileReport::failed(&entry.name, outcome, e.to_string()));
            }
            Err(e) => return Err(e),
        };

        info!("Loading {} into {}", entry.name, resolved.layout.table);
        tracker
            .lock()
            .await
            .mark_file_started(&entry.name, &resolved.layout.table)?;

        let mut stats = LoadStats::default();
        let loaded = self
            .loader
            .load_into(
                &self.store,
                &resolved.layout,
                &entry.name,
                &resolved.contents,
                halt,
                &mut stats,
            )
            .await;
        if let Err(e) = loaded {
            if stats.batches == 0 {
                if let Err(save) = tracker.lock().await.forget_started(&entry.name) {
                    warn!("Cannot update the ledger for {}: {}", entry.name, save);
                }
            } else {
                warn!(
                    "{} left {} row(s) in {}; reload it with --truncate",
                    entry.name, stats.rows, resolved.layout.table
                );
            }
            if !matches!(e, AppError::Cancelled) {
                error!("Load of {} failed: {}", entry.name, e);
                halt.cancel();
            }
            return Err(e);
        }

        tracker.lock().await.mark_file_uploaded(
            &entry.name,
            LedgerEntry {
                loaded_at: Utc::now(),
                table: resolved.layout.table.clone(),
                rows: stats.rows,
                sha256: resolved.sha256,
            },
        )?;

        if stats.dates_coerced > 0 {
            warn!(
                "{}: {} malformed date value(s) stored as null",
                entry.name, stats.dates_coerced
            );
        }
        info!(
            "Loaded {} into {}: {} rows in {} batch(es)",
            entry.name, resolved.layout.table, stats.rows, stats.batches
        );

        Ok(FileReport {
            table: Some(resolved.layout.table),
            rows: stats.rows,
            batches: stats.batches,
            dates_coerced: stats.dates_coerced,
            ..FileReport::new(&entry.name, FileOutcome::Loaded)
        })
    }

    /// Downloads with up to `fetch_attempts` tries.
    async fn fetch_archive(&self, entry: &FileEntry, destination: &Path) -> Result<(), AppError> {
        let attempts = self.config.fetch_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.source.fetch_file(entry, destination).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && !self.cancel.is_cancelled() => {
                    warn!(
                        "Fetch of {} failed (attempt {}/{}): {}",
                        entry.name, attempt, attempts, e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Entries named in `only`, in the order requested. Unknown names are a
/// configuration error.
fn select_entries(release: &Release, only: &[String]) -> Result<Vec<FileEntry>, AppError> {
    if only.is_empty() {
        return Ok(release.entries.clone());
    }

    let mut selected: Vec<FileEntry> = Vec::with_capacity(only.len());
    for name in only {
        let entry = release
            .entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                AppError::ConfigError(format!(
                    "{} is not listed in release {}",
                    name, release.last_update
                ))
            })?;
        if !selected.iter().any(|chosen| chosen.name == entry.name) {
            selected.push(entry.clone());
        }
    }
    Ok(selected)
}

fn advance(state: &mut RunState, next: RunState) {
    debug_assert!(
        state.can_advance_to(next),
        "illegal transition {} -> {}",
        state,
        next
    );
    debug!("{} -> {}", state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release() -> Release {
        Release {
            last_update: "12/03/2024".to_string(),
            entries: vec![
                FileEntry::new("Cnaes.zip", "http://h/Cnaes.zip"),
                FileEntry::new("Simples.zip", "http://h/Simples.zip"),
            ],
        }
    }

    #[test]
    fn test_empty_selection_keeps_release() {
        assert_eq!(select_entries(&release(), &[]).unwrap(), release().entries);
    }

    #[test]
    fn test_selection_matches_name_ignoring_case() {
        let selected = select_entries(
            &release(),
            &["simples.zip".to_string(), "Simples.zip".to_string()],
        )
        .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "Simples.zip");
    }

    #[test]
    fn test_selection_of_unlisted_archive_fails() {
        let result = select_entries(&release(), &["Empresas0.zip".to_string()]);
        assert!(matches!(result, Err(AppError::ConfigError(msg)) if msg.contains("Empresas0.zip")));
    }

    #[test]
    fn test_default_options() {
        let options = RunOptions::default();
        assert!(options.download);
        assert!(options.upload);
        assert!(!options.index_base);
        assert!(!options.first_upload_truncate);
        assert!(!options.force);
    }
}
