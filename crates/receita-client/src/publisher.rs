use crate::catalog::parse_release;
use crate::fetcher;
use async_trait::async_trait;
use receita_core::config::{HttpConfig, PublisherConfig};
use receita_core::error::AppError;
use receita_core::models::{FileEntry, Release};
use receita_core::pipeline::ReleaseSource;
use reqwest::{Client, StatusCode, Url};
use std::path::Path;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Receita/0.1 (open-data-loader)";

/// HTTP client for the publisher of the CNPJ open-data release.
///
/// # Examples
///
/// ```no_run
/// use receita_client::PublisherClient;
/// use receita_core::config::{HttpConfig, PublisherConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = PublisherClient::new(PublisherConfig::default(), HttpConfig::default())?;
/// let release = client.fetch_index().await?;
/// println!("{} archives, updated {}", release.entries.len(), release.last_update);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PublisherClient {
    /// Index requests, bounded by the configured timeout.
    client: Client,
    /// Archive downloads; multi-gigabyte bodies get no overall timeout.
    download_client: Client,
    index_url: Url,
    publisher: PublisherConfig,
    http: HttpConfig,
}

impl PublisherClient {
    /// Creates a client for the configured index page.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the index URL is malformed.
    /// Returns `AppError::Generic` if the HTTP client cannot be built.
    pub fn new(publisher: PublisherConfig, http: HttpConfig) -> Result<Self, AppError> {
        let index_url = Url::parse(&publisher.index_url)
            .map_err(|e| AppError::InvalidUrl(format!("{}: {}", publisher.index_url, e)))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(http.timeout)
            .connect_timeout(http.connect_timeout)
            .build()
            .map_err(|e| AppError::Generic(e.to_string()))?;

        let download_client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(http.connect_timeout)
            .build()
            .map_err(|e| AppError::Generic(e.to_string()))?;

        Ok(Self {
            client,
            download_client,
            index_url,
            publisher,
            http,
        })
    }

    pub fn index_url(&self) -> &Url {
        &self.index_url
    }

    /// Fetches and parses the index page.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CatalogUnavailable` if the page cannot be fetched
    /// after the configured retries or does not describe a release.
    pub async fn fetch_index(&self) -> Result<Release, AppError> {
        info!("Reading release index {}", self.index_url);
        let resp = self.request_with_retry(&self.index_url).await?;
        let html = resp
            .text()
            .await
            .map_err(|e| AppError::CatalogUnavailable(e.to_string()))?;

        let release = parse_release(&html, &self.index_url, &self.publisher)?;
        debug!(
            "Index lists {} archive(s), last update {}",
            release.entries.len(),
            release.last_update
        );
        Ok(release)
    }

    /// Makes a GET request, retrying on network errors, timeouts, server
    /// errors (5xx) and rate limiting (429).
    async fn request_with_retry(&self, url: &Url) -> Result<reqwest::Response, AppError> {
        let max_retries = self.http.max_retries.max(1);
        let base_delay = self.http.retry_base_delay;
        let mut last_error = AppError::CatalogUnavailable("no attempts made".to_string());

        for attempt in 1..=max_retries {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        return Ok(resp);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = AppError::CatalogUnavailable(format!(
                            "rate limited by {}",
                            url.host_str().unwrap_or_default()
                        ));
                        if attempt < max_retries {
                            sleep(base_delay * 2_u32.pow(attempt)).await;
                            continue;
                        }
                    }

                    if status.is_server_error() {
                        last_error = AppError::CatalogUnavailable(format!(
                            "server error: HTTP {}",
                            status.as_u16()
                        ));
                        if attempt < max_retries {
                            warn!(
                                "Index request failed with HTTP {} (attempt {}/{})",
                                status.as_u16(),
                                attempt,
                                max_retries
                            );
                            sleep(base_delay * attempt).await;
                            continue;
                        }
                    }

                    return Err(AppError::CatalogUnavailable(format!(
                        "HTTP {} from {}",
                        status.as_u16(),
                        url
                    )));
                }
                Err(e) => {
                    last_error = if e.is_timeout() {
                        AppError::CatalogUnavailable(format!(
                            "request timed out after {}s",
                            self.http.timeout.as_secs()
                        ))
                    } else if e.is_connect() {
                        AppError::CatalogUnavailable(format!("connection failed: {}", e))
                    } else {
                        AppError::CatalogUnavailable(e.to_string())
                    };

                    if attempt < max_retries && (e.is_timeout() || e.is_connect()) {
                        sleep(base_delay * attempt).await;
                        continue;
                    }
                    return Err(last_error);
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl ReleaseSource for PublisherClient {
    async fn fetch_release(&self) -> Result<Release, AppError> {
        self.fetch_index().await
    }

    async fn fetch_file(&self, entry: &FileEntry, destination: &Path) -> Result<(), AppError> {
        fetcher::fetch(&self.download_client, &entry.url, destination).await?;
        Ok(())
    }
}
