//! Streams one decompressed file into its destination table in batches.

use crate::config::{Encoding, PipelineConfig};
use crate::error::{AppError, StoreError};
use crate::layout::{IndexSpec, Layout};
use crate::normalize::normalize_batch;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Destination store operations the pipeline relies on.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Drops and recreates the table of `layout`, leaving it empty.
    async fn recreate_table(&self, layout: &Layout) -> Result<(), StoreError>;

    /// Inserts a CSV-encoded batch in a single round trip. Returns the number
    /// of rows the store accepted.
    async fn copy_batch(&self, layout: &Layout, payload: &[u8]) -> Result<u64, StoreError>;

    /// Creates the given indexes; existing ones are left alone.
    async fn create_indexes(&self, indexes: &[IndexSpec]) -> Result<(), StoreError>;
}

/// Totals for one loaded file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: u64,
    pub batches: u64,
    pub dates_coerced: u64,
}

/// Parses delimited text and bulk-inserts it batch by batch.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    batch_size: usize,
    retry_backoff: Duration,
    delimiter: u8,
    encoding: Encoding,
}

impl BatchLoader {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            retry_backoff: config.retry_backoff,
            delimiter: config.delimiter,
            encoding: config.encoding,
        }
    }

    /// Loads `contents` (headerless delimited text) into `layout.table`.
    ///
    /// Rows keep their source order across batches. A transient store failure
    /// is retried once after the backoff; a second failure, or any rejected
    /// batch, fails the whole file. Cancellation is honoured between batches,
    /// never during an insert.
    pub async fn load<S: TableStore + ?Sized>(
        &self,
        store: &S,
        layout: &Layout,
        file_name: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<LoadStats, AppError> {
        let mut stats = LoadStats::default();
        self.load_into(store, layout, file_name, contents, cancel, &mut stats)
            .await?;
        Ok(stats)
    }

    /// Like [`load`](Self::load), but counts into `stats`. When the load
    /// fails, `stats` still describes the batches already stored.
    pub async fn load_into<S: TableStore + ?Sized>(
        &self,
        store: &S,
        layout: &Layout,
        file_name: &str,
        contents: &[u8],
        cancel: &CancellationToken,
        stats: &mut LoadStats,
    ) -> Result<(), AppError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(contents);

        let mut batch: Vec<Vec<String>> = Vec::with_capacity(self.batch_size.min(65_536));
        let mut record = csv::ByteRecord::new();

        loop {
            let has_row = reader
                .read_byte_record(&mut record)
                .map_err(|e| AppError::UnpackFailed {
                    name: file_name.to_string(),
                    cause: format!("unreadable delimited text: {}", e),
                })?;
            if !has_row {
                break;
            }

            if record.len() != layout.width() {
                return Err(AppError::MalformedRow {
                    file: file_name.to_string(),
                    line: record.position().map(|p| p.line()).unwrap_or(0),
                    expected: layout.width(),
                    found: record.len(),
                });
            }

            batch.push(
                record
                    .iter()
                    .map(|field| self.encoding.decode(field).into_owned())
                    .collect(),
            );

            if batch.len() == self.batch_size {
                self.flush(store, layout, file_name, &batch, stats, cancel)
                    .await?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.flush(store, layout, file_name, &batch, stats, cancel)
                .await?;
        }

        Ok(())
    }

    async fn flush<S: TableStore + ?Sized>(
        &self,
        store: &S,
        layout: &Layout,
        file_name: &str,
        rows: &[Vec<String>],
        stats: &mut LoadStats,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let normalized = normalize_batch(layout, rows)?;
        self.insert_with_retry(store, layout, file_name, &normalized.payload)
            .await?;

        stats.batches += 1;
        stats.rows += normalized.rows as u64;
        stats.dates_coerced += normalized.dates_coerced;
        debug!(
            "{}: batch {} stored ({} rows, {} total)",
            file_name, stats.batches, normalized.rows, stats.rows
        );
        Ok(())
    }

    async fn insert_with_retry<S: TableStore + ?Sized>(
        &self,
        store: &S,
        layout: &Layout,
        file_name: &str,
        payload: &[u8],
    ) -> Result<u64, AppError> {
        let load_failed = |cause: StoreError| AppError::LoadFailed {
            file: file_name.to_string(),
            table: layout.table.clone(),
            cause,
        };

        match store.copy_batch(layout, payload).await {
            Ok(rows) => Ok(rows),
            Err(cause) if cause.is_transient() => {
                warn!(
                    "{}: {}; retrying batch in {}s",
                    file_name,
                    cause,
                    self.retry_backoff.as_secs()
                );
                tokio::time::sleep(self.retry_backoff).await;
                store.copy_batch(layout, payload).await.map_err(load_failed)
            }
            Err(cause) => Err(load_failed(cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Store that records every payload and fails according to a script.
    #[derive(Default)]
    struct RecordingStore {
        payloads: Mutex<Vec<Vec<u8>>>,
        failures: Mutex<Vec<StoreError>>,
        attempts: Mutex<usize>,
    }

    impl RecordingStore {
        fn failing_with(failures: Vec<StoreError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Self::default()
            }
        }

        fn rows(&self) -> Vec<String> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .flat_map(|p| {
                    String::from_utf8(p.clone())
                        .unwrap()
                        .lines()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .collect()
        }
    }

    #[async_trait]
    impl TableStore for RecordingStore {
        async fn recreate_table(&self, _layout: &Layout) -> Result<(), StoreError> {
            Ok(())
        }

        async fn copy_batch(&self, _layout: &Layout, payload: &[u8]) -> Result<u64, StoreError> {
            *self.attempts.lock().unwrap() += 1;
            let scripted = {
                let mut failures = self.failures.lock().unwrap();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            if let Some(err) = scripted {
                return Err(err);
            }
            self.payloads.lock().unwrap().push(payload.to_vec());
            Ok(payload.iter().filter(|&&b| b == b'\n').count() as u64)
        }

        async fn create_indexes(&self, _indexes: &[IndexSpec]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn paises() -> Layout {
        Layout::new("PAISES", "tb_pais", &["cd_pais", "st_pais"])
    }

    fn loader(batch_size: usize) -> BatchLoader {
        BatchLoader::new(&PipelineConfig {
            batch_size,
            retry_backoff: Duration::from_secs(60),
            ..PipelineConfig::default()
        })
    }

    fn source(rows: usize) -> Vec<u8> {
        (0..rows)
            .map(|i| format!("\"{}\";\"PAIS {}\"\n", i, i))
            .collect::<String>()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_batches_split_at_batch_size() {
        let store = RecordingStore::default();
        let stats = loader(65_000)
            .load(
                &store,
                &paises(),
                "Paises.zip",
                &source(130_001),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.rows, 130_001);
        assert_eq!(*store.attempts.lock().unwrap(), 3);

        let sizes: Vec<usize> = store
            .payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.iter().filter(|&&b| b == b'\n').count())
            .collect();
        assert_eq!(sizes, vec![65_000, 65_000, 1]);

        let rows = store.rows();
        assert_eq!(rows[0], "0,PAIS 0");
        assert_eq!(rows[64_999], "64999,PAIS 64999");
        assert_eq!(rows[65_000], "65000,PAIS 65000");
        assert_eq!(rows[130_000], "130000,PAIS 130000");
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_batch() {
        let store = RecordingStore::default();
        let stats = loader(2)
            .load(&store, &paises(), "Paises.zip", &source(4), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(*store.attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_source_inserts_nothing() {
        let store = RecordingStore::default();
        let stats = loader(10)
            .load(&store, &paises(), "Paises.zip", b"", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, LoadStats::default());
        assert_eq!(*store.attempts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latin1_fields_decoded() {
        let store = RecordingStore::default();
        loader(10)
            .load(
                &store,
                &paises(),
                "Paises.zip",
                b"\"5\";\"S\xc3O TOM\xc9\"\n",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(store.rows(), vec!["5,SÃO TOMÉ".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_width_is_malformed_row() {
        let store = RecordingStore::default();
        let result = loader(10)
            .load(
                &store,
                &paises(),
                "Paises.zip",
                b"\"1\";\"A\"\n\"2\";\"B\";\"extra\"\n",
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(AppError::MalformedRow {
                line,
                expected,
                found,
                ..
            }) => {
                assert_eq!(line, 2);
                assert_eq!(expected, 2);
                assert_eq!(found, 3);
            }
            other => panic!("expected MalformedRow, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_once_after_backoff() {
        let store = RecordingStore::failing_with(vec![StoreError::Transient("reset".into())]);
        let started = tokio::time::Instant::now();
        let stats = loader(10)
            .load(&store, &paises(), "Paises.zip", &source(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.batches, 1);
        assert_eq!(*store.attempts.lock().unwrap(), 2);
        assert_eq!(store.rows().len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_transient_failure_is_fatal() {
        let store = RecordingStore::failing_with(vec![
            StoreError::Transient("reset".into()),
            StoreError::Transient("reset again".into()),
        ]);
        let result = loader(10)
            .load(&store, &paises(), "Paises.zip", &source(3), &CancellationToken::new())
            .await;

        match result {
            Err(AppError::LoadFailed { file, table, cause }) => {
                assert_eq!(file, "Paises.zip");
                assert_eq!(table, "tb_pais");
                assert_eq!(cause, StoreError::Transient("reset again".into()));
            }
            other => panic!("expected LoadFailed, got {:?}", other),
        }
        assert_eq!(*store.attempts.lock().unwrap(), 2);
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_batch_not_retried() {
        let store = RecordingStore::failing_with(vec![StoreError::Rejected("bad value".into())]);
        let result = loader(10)
            .load(&store, &paises(), "Paises.zip", &source(3), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::LoadFailed { .. })));
        assert_eq!(*store.attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let store = RecordingStore::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = loader(10)
            .load(&store, &paises(), "Paises.zip", &source(3), &cancel)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(*store.attempts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_load_reports_stored_batches() {
        let store = RecordingStore::default();
        let mut stats = LoadStats::default();
        let result = loader(1)
            .load_into(
                &store,
                &paises(),
                "Paises.zip",
                b"\"1\";\"A\"\n\"2\";\"B\"\n\"3\";\"C\";\"extra\"\n",
                &CancellationToken::new(),
                &mut stats,
            )
            .await;

        assert!(matches!(result, Err(AppError::MalformedRow { line: 3, .. })));
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.rows, 2);
        assert_eq!(store.rows().len(), 2);
    }
}
