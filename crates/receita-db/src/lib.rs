//! Receita DB - PostgreSQL destination store.
//!
//! Provides connection handling for `?schema=` connection strings and a
//! [`TableStore`](receita_core::loader::TableStore) implementation based on
//! `COPY ... FROM STDIN` and hash indexes.

pub mod connection;
pub mod store;

pub use connection::{connect, parse_database_url, ConnectionTarget};
pub use store::PgTableStore;
