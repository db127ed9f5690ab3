//! Streaming archive downloads.
//!
//! The body is written chunk by chunk to `<destination>.part` and renamed to
//! `destination` only once the stream has ended, so an interrupted download
//! never leaves a file under the final name.

use futures::StreamExt;
use receita_core::error::AppError;
use reqwest::Client;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

/// Downloads `url` to `destination`, returning the number of bytes written.
///
/// No retry happens here; the caller decides whether to try again.
pub async fn fetch(client: &Client, url: &str, destination: &Path) -> Result<u64, AppError> {
    let part = part_path(destination);

    match stream_to(client, url, &part).await {
        Ok(bytes) => {
            tokio::fs::rename(&part, destination)
                .await
                .map_err(|e| AppError::FetchFailed {
                    url: url.to_string(),
                    cause: format!("cannot finalize {}: {}", destination.display(), e),
                })?;
            info!("Downloaded {} ({} bytes)", destination.display(), bytes);
            Ok(bytes)
        }
        Err(cause) => {
            if let Err(e) = tokio::fs::remove_file(&part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Could not remove {}: {}", part.display(), e);
                }
            }
            Err(AppError::FetchFailed {
                url: url.to_string(),
                cause,
            })
        }
    }
}

async fn stream_to(client: &Client, url: &str, part: &Path) -> Result<u64, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {}", status.as_u16()));
    }

    if let Some(parent) = part.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| e.to_string())?;
    }
    let file = File::create(part)
        .await
        .map_err(|e| format!("cannot create {}: {}", part.display(), e))?;
    let mut writer = BufWriter::new(file);

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| format!("stream interrupted after {} bytes: {}", written, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| e.to_string())?;
        written += chunk.len() as u64;
    }
    writer.flush().await.map_err(|e| e.to_string())?;

    debug!("Streamed {} bytes from {}", written, url);
    Ok(written)
}

/// `<destination>.part`
fn part_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}
