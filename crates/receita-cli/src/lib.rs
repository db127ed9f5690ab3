//! Receita CLI - Command-line interface for the Receita bulk loader
//!
//! This crate provides the `receita` binary that ties the publisher client,
//! the ingestion pipeline and the PostgreSQL store together.

pub mod config;
pub mod report;

pub use config::{Command, Config, OutputFormat, RunArgs};

use async_trait::async_trait;
use receita_core::error::StoreError;
use receita_core::layout::{IndexSpec, Layout};
use receita_core::loader::TableStore;

/// Store for download-only runs, where no database is configured.
///
/// The pipeline never calls it when the load stage is disabled; every
/// operation fails if it does.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineStore;

#[async_trait]
impl TableStore for OfflineStore {
    async fn recreate_table(&self, layout: &Layout) -> Result<(), StoreError> {
        Err(offline(&layout.table))
    }

    async fn copy_batch(&self, layout: &Layout, _payload: &[u8]) -> Result<u64, StoreError> {
        Err(offline(&layout.table))
    }

    async fn create_indexes(&self, indexes: &[IndexSpec]) -> Result<(), StoreError> {
        match indexes.first() {
            Some(index) => Err(offline(&index.table)),
            None => Ok(()),
        }
    }
}

fn offline(table: &str) -> StoreError {
    StoreError::Rejected(format!("no database configured for {}", table))
}
