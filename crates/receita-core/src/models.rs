use serde::Serialize;

/// One downloadable archive listed by the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Archive file name as published, e.g. `Empresas0.zip`.
    pub name: String,
    /// Absolute download URL.
    pub url: String,
    /// Record-type identifier inferred from the name.
    pub record_type: String,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        let record_type = record_type_from_file_name(&name);
        Self {
            name,
            url: url.into(),
            record_type,
        }
    }
}

/// One publisher snapshot: an opaque last-update token and its archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Release {
    pub last_update: String,
    pub entries: Vec<FileEntry>,
}

/// Derives the record-type identifier from an archive file name.
///
/// The `.zip` suffix is dropped, every non-alphabetic character removed and
/// the remainder upper-cased.
///
/// # Examples
///
/// ```
/// use receita_core::models::record_type_from_file_name;
///
/// assert_eq!(record_type_from_file_name("Estabelecimentos9.zip"), "ESTABELECIMENTOS");
/// assert_eq!(record_type_from_file_name("Simples.ZIP"), "SIMPLES");
/// ```
pub fn record_type_from_file_name(name: &str) -> String {
    let stem = match name.len().checked_sub(4) {
        Some(cut) if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(".zip") => {
            &name[..cut]
        }
        _ => name,
    };
    stem.chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_uppercase)
        .collect()
}
