use thiserror::Error;

/// Failure reported by a destination store for a single operation.
///
/// Only [`StoreError::Transient`] failures are worth retrying: a connection
/// that dropped mid-copy may succeed on a fresh one, while a batch the engine
/// rejected for schema or data reasons will be rejected again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection loss, pool exhaustion or another condition expected to clear up.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The store refused the statement or the data.
    #[error("store rejected the operation: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Returns true if the failed operation may be retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Application-wide error types.
///
/// The first group of variants is the ingestion taxonomy. Per-file variants
/// (`FetchFailed`, `UnpackFailed`, `UnknownLayout`) only skip the affected
/// archive; every other variant halts the run and leaves the progress marker
/// untouched.
///
/// # Examples
///
/// ```
/// use receita_core::error::AppError;
///
/// let err = AppError::UnknownLayout { name: "Unknown.zip".to_string() };
/// assert!(err.is_per_file());
/// assert_eq!(err.to_string(), "No layout registered for Unknown.zip");
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// The publisher index could not be fetched or parsed.
    #[error("Release catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Downloading one archive failed.
    #[error("Failed to fetch {url}: {cause}")]
    FetchFailed { url: String, cause: String },

    /// The archive is corrupt, missing, or does not hold exactly one entry.
    #[error("Failed to unpack {name}: {cause}")]
    UnpackFailed { name: String, cause: String },

    /// The record type derived from the file name has no layout.
    #[error("No layout registered for {name}")]
    UnknownLayout { name: String },

    /// A batch could not be stored, even after the retry.
    #[error("Failed to load {file} into {table}: {cause}")]
    LoadFailed {
        file: String,
        table: String,
        #[source]
        cause: StoreError,
    },

    /// A table-level operation (recreate, index) failed.
    #[error("Failed to {operation} on {table}: {cause}")]
    StoreFailed {
        operation: &'static str,
        table: String,
        #[source]
        cause: StoreError,
    },

    /// A source row does not have the layout's field count.
    #[error("{file} line {line}: expected {expected} fields, found {found}")]
    MalformedRow {
        file: String,
        line: u64,
        expected: usize,
        found: usize,
    },

    /// An earlier run stored part of these archives and stopped. Loading them
    /// again on top of that prefix would duplicate rows.
    #[error("Partially loaded by an earlier run: {}", .files.join(", "))]
    PartialLoad { files: Vec<String> },

    /// Database operation failed outside of the batch path.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Local filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration could not be read or is inconsistent.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The run was cancelled before it completed.
    #[error("Run cancelled before completion")]
    Cancelled,

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error only affects a single file of the release.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            AppError::FetchFailed { .. }
                | AppError::UnpackFailed { .. }
                | AppError::UnknownLayout { .. }
        )
    }

    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::CatalogUnavailable(msg) => {
                format!(
                    "Cannot read the publisher index: {}\n   Check the index URL and your internet connection.",
                    msg
                )
            }
            AppError::LoadFailed { file, table, cause } if cause.is_transient() => {
                format!(
                    "Lost the database connection while loading {} into {}.\n   The marker was not advanced. If any batch of {} was stored, rerun with --truncate; otherwise a plain rerun resumes with the remaining files.",
                    file, table, file
                )
            }
            AppError::LoadFailed { file, table, cause } => {
                format!(
                    "The database rejected data from {} for {}: {}\n   Check the layout definition for this record type.",
                    file, table, cause
                )
            }
            AppError::MalformedRow { file, line, .. } => {
                format!(
                    "{}\n   {} does not match its layout; the table now holds a partial load up to line {}. Fix the layout, then rerun with --truncate.",
                    self, file, line
                )
            }
            AppError::PartialLoad { files } => {
                format!(
                    "{} stopped part way through an earlier run.\n   Rerun with --truncate to recreate the affected tables before loading again.",
                    files.join(", ")
                )
            }
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::Cancelled => {
                "Run cancelled. The marker was not advanced; the next run retries this release."
                    .to_string()
            }
            _ => self.to_string(),
        }
    }
}
