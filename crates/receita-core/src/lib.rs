//! Receita Core - Layouts, change detection, batch loading and orchestration.

pub mod archive;
pub mod config;
pub mod error;
pub mod layout;
pub mod loader;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod sync;

pub use config::{
    default_config_path, load_settings, DbConfig, Encoding, HttpConfig, PipelineConfig,
    PublisherConfig, Settings,
};
pub use error::{AppError, StoreError};
pub use layout::{ColumnKind, IndexSpec, Layout, LayoutRegistry};
pub use loader::{BatchLoader, LoadStats, TableStore};
pub use models::{FileEntry, Release};
pub use pipeline::{Pipeline, ReleaseSource, RunOptions};
pub use progress::{Ledger, LedgerEntry, PartialEntry, ProgressTracker};
pub use sync::{should_run, FileOutcome, FileReport, RunState, RunStats, RunSummary};
