//! Unpacking of staged archives and dispatch to their layout.

use crate::error::AppError;
use crate::layout::{Layout, LayoutRegistry};
use crate::models::FileEntry;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// A staged archive matched to its layout, with its single entry decompressed.
#[derive(Debug)]
pub struct ResolvedFile {
    pub layout: Layout,
    pub contents: Vec<u8>,
    pub sha256: String,
}

/// Decompresses the only file inside the archive at `path`.
///
/// The archive must hold exactly one non-directory entry; anything else is an
/// `UnpackFailed` error naming `name`.
pub fn read_single_entry(path: &Path, name: &str) -> Result<Vec<u8>, AppError> {
    let unpack_err = |cause: String| AppError::UnpackFailed {
        name: name.to_string(),
        cause,
    };

    let file = File::open(path).map_err(|e| unpack_err(format!("{}: {}", path.display(), e)))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| unpack_err(format!("not a zip archive: {}", e)))?;

    let mut files = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| unpack_err(format!("unreadable entry {}: {}", i, e)))?;
        if !entry.is_dir() {
            files.push(i);
        }
    }

    let index = match files.as_slice() {
        [only] => *only,
        other => {
            return Err(unpack_err(format!(
                "expected exactly one entry, found {}",
                other.len()
            )))
        }
    };

    let mut entry = archive
        .by_index(index)
        .map_err(|e| unpack_err(e.to_string()))?;
    let mut contents = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
    entry
        .read_to_end(&mut contents)
        .map_err(|e| unpack_err(format!("corrupt entry {}: {}", entry.name(), e)))?;

    debug!(
        "Unpacked {} -> {} ({} bytes)",
        name,
        entry.name(),
        contents.len()
    );
    Ok(contents)
}

/// Resolves the layout of `entry` and unpacks its staged archive.
///
/// The layout is checked first so unknown record types never touch the disk.
pub fn resolve(
    entry: &FileEntry,
    registry: &LayoutRegistry,
    staging_dir: &Path,
) -> Result<ResolvedFile, AppError> {
    let layout = registry.resolve(entry)?.clone();
    let contents = read_single_entry(&staging_dir.join(&entry.name), &entry.name)?;
    let sha256 = content_digest(&contents);
    Ok(ResolvedFile {
        layout,
        contents,
        sha256,
    })
}

/// Hex SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
