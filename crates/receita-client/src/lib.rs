//! Receita Client - access to the release publisher
//!
//! - [`catalog`] - scraping of the index page into a release
//! - [`publisher`] - HTTP client for the index, implementing `ReleaseSource`
//! - [`fetcher`] - streaming archive downloads

pub mod catalog;
pub mod fetcher;
pub mod publisher;

pub use catalog::parse_release;
pub use publisher::PublisherClient;
