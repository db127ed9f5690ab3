//! Configuration types for Receita components.
//!
//! Every struct has working defaults. An optional TOML settings file can
//! override publisher, pipeline and layout settings; command-line flags are
//! applied on top by the binary.

use crate::error::AppError;
use crate::layout::{IndexSpec, Layout, LayoutRegistry, LayoutSpec};
use serde::Deserialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Publisher index page of the federal company registry release.
pub const DEFAULT_INDEX_URL: &str = "https://www.gov.br/receitafederal/pt-br/assuntos/orientacao-tributaria/cadastros/consultas/dados-publicos-cnpj";

/// Database connection pool configuration.
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// HTTP client configuration for publisher requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Applies to the index request only; archive downloads are unbounded in time.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Where the release is published and how its timestamp is found.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub index_url: String,
    /// Text that precedes the last-update token on the index page.
    pub timestamp_anchor: String,
    /// Regular expression matching the last-update token after the anchor.
    pub timestamp_pattern: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_INDEX_URL.to_string(),
            timestamp_anchor: "Atualizado em".to_string(),
            timestamp_pattern: r"\d{2}/\d{2}/\d{4}".to_string(),
        }
    }
}

/// Character set of the published delimited files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Encoding {
    /// ISO-8859-1: every byte is the code point of the same value.
    #[default]
    Latin1,
    Utf8,
}

impl Encoding {
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self {
            Encoding::Latin1 => {
                if bytes.is_ascii() {
                    // ASCII is valid UTF-8 and maps to itself in Latin-1.
                    Cow::Borrowed(std::str::from_utf8(bytes).unwrap_or_default())
                } else {
                    Cow::Owned(bytes.iter().map(|&b| b as char).collect())
                }
            }
            Encoding::Utf8 => String::from_utf8_lossy(bytes),
        }
    }
}

impl FromStr for Encoding {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Ok(Encoding::Latin1),
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            other => Err(AppError::ConfigError(format!(
                "unsupported encoding: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Ingestion pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows per bulk insert.
    pub batch_size: usize,
    /// Wait before the single retry of a batch after a transient failure.
    pub retry_backoff: Duration,
    pub delimiter: u8,
    pub encoding: Encoding,
    /// Files processed at the same time.
    pub concurrency: usize,
    /// Download attempts per archive before it is reported as failed.
    pub fetch_attempts: u32,
    pub staging_dir: PathBuf,
    pub marker_path: PathBuf,
    pub ledger_path: PathBuf,
}

impl PipelineConfig {
    /// Places downloads, the marker and the ledger under `dir`.
    pub fn with_staging_dir(dir: impl Into<PathBuf>) -> Self {
        let staging_dir = dir.into();
        Self {
            marker_path: staging_dir.join("info.txt"),
            ledger_path: staging_dir.join("ledger.json"),
            staging_dir,
            ..Self::default()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let staging_dir = PathBuf::from("staging");
        Self {
            batch_size: 65_000,
            retry_backoff: Duration::from_secs(60),
            delimiter: b';',
            encoding: Encoding::Latin1,
            concurrency: 1,
            fetch_attempts: 2,
            marker_path: staging_dir.join("info.txt"),
            ledger_path: staging_dir.join("ledger.json"),
            staging_dir,
        }
    }
}

/// Contents of the optional `receita.toml` settings file.
///
/// ```toml
/// [publisher]
/// index_url = "https://example.org/dados-publicos"
///
/// [pipeline]
/// batch_size = 50000
/// encoding = "latin1"
///
/// [[layouts]]
/// record_type = "PAISES"
/// table = "tb_pais"
/// columns = ["cd_pais", "st_pais"]
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub publisher: PublisherSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Replaces the built-in layouts when non-empty.
    #[serde(default)]
    pub layouts: Vec<LayoutSpec>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherSettings {
    pub index_url: Option<String>,
    pub timestamp_anchor: Option<String>,
    pub timestamp_pattern: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    pub batch_size: Option<usize>,
    pub retry_backoff_secs: Option<u64>,
    pub delimiter: Option<char>,
    pub encoding: Option<Encoding>,
    pub concurrency: Option<usize>,
    pub fetch_attempts: Option<u32>,
    pub staging_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self, AppError> {
        toml::from_str(content).map_err(|e| AppError::ConfigError(e.to_string()))
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        let defaults = PublisherConfig::default();
        PublisherConfig {
            index_url: self
                .publisher
                .index_url
                .clone()
                .unwrap_or(defaults.index_url),
            timestamp_anchor: self
                .publisher
                .timestamp_anchor
                .clone()
                .unwrap_or(defaults.timestamp_anchor),
            timestamp_pattern: self
                .publisher
                .timestamp_pattern
                .clone()
                .unwrap_or(defaults.timestamp_pattern),
        }
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, AppError> {
        let p = &self.pipeline;
        let mut config = match &p.staging_dir {
            Some(dir) => PipelineConfig::with_staging_dir(dir),
            None => PipelineConfig::default(),
        };
        if let Some(batch_size) = p.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(secs) = p.retry_backoff_secs {
            config.retry_backoff = Duration::from_secs(secs);
        }
        if let Some(delimiter) = p.delimiter {
            config.delimiter = u8::try_from(delimiter).map_err(|_| {
                AppError::ConfigError(format!("delimiter must be a single byte: {:?}", delimiter))
            })?;
        }
        if let Some(encoding) = p.encoding {
            config.encoding = encoding;
        }
        if let Some(concurrency) = p.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(attempts) = p.fetch_attempts {
            config.fetch_attempts = attempts;
        }
        validate_pipeline(&config)?;
        Ok(config)
    }

    /// Custom layouts when the file defines any, the built-in registry otherwise.
    pub fn layout_registry(&self) -> Result<LayoutRegistry, AppError> {
        if self.layouts.is_empty() {
            if !self.indexes.is_empty() {
                return Err(AppError::ConfigError(
                    "[[indexes]] requires [[layouts]] in the same file".to_string(),
                ));
            }
            return Ok(LayoutRegistry::cnpj());
        }
        let layouts = self.layouts.iter().map(Layout::from).collect();
        LayoutRegistry::new(layouts, self.indexes.clone())
    }
}

/// Checks values that would otherwise fail deep inside a run.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<(), AppError> {
    if config.batch_size == 0 {
        return Err(AppError::ConfigError("batch_size must be positive".into()));
    }
    if config.concurrency == 0 {
        return Err(AppError::ConfigError("concurrency must be positive".into()));
    }
    if config.fetch_attempts == 0 {
        return Err(AppError::ConfigError("fetch_attempts must be positive".into()));
    }
    Ok(())
}

/// Default location of the settings file: `<config dir>/receita/receita.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("receita").join("receita.toml"))
}

/// Loads settings from `path`, or from the default location when `path` is
/// `None`. A missing default file yields the built-in defaults; a missing
/// explicit file is an error.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, AppError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return Ok(Settings::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            tracing::debug!("Loaded settings from {}", path.display());
            Settings::from_toml_str(&content)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Settings::default()),
        Err(e) => Err(AppError::ConfigError(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 65_000);
        assert_eq!(config.retry_backoff, Duration::from_secs(60));
        assert_eq!(config.delimiter, b';');
        assert_eq!(config.encoding, Encoding::Latin1);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.marker_path, PathBuf::from("staging/info.txt"));
    }

    #[test]
    fn test_with_staging_dir_moves_state_files() {
        let config = PipelineConfig::with_staging_dir("/data/cnpj");
        assert_eq!(config.ledger_path, PathBuf::from("/data/cnpj/ledger.json"));
        assert_eq!(config.marker_path, PathBuf::from("/data/cnpj/info.txt"));
    }

    #[test]
    fn test_latin1_decoding() {
        let bytes = b"S\xc3O PAULO";
        assert_eq!(Encoding::Latin1.decode(bytes), "SÃO PAULO");
        assert_eq!(Encoding::Latin1.decode(b"plain"), "plain");
    }

    #[test]
    fn test_utf8_decoding_is_lossy() {
        assert_eq!(Encoding::Utf8.decode("SÃO".as_bytes()), "SÃO");
        assert_eq!(Encoding::Utf8.decode(b"S\xc3O"), "S\u{fffd}O");
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("ISO-8859-1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert_eq!("utf_8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert!("ebcdic".parse::<Encoding>().is_err());
    }

    #[test]
    fn test_settings_override_pipeline() {
        let settings = Settings::from_toml_str(
            r#"
            [pipeline]
            batch_size = 1000
            retry_backoff_secs = 5
            delimiter = ","
            encoding = "utf-8"
            staging_dir = "/tmp/receita"
            "#,
        )
        .unwrap();
        let config = settings.pipeline_config().unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.delimiter, b',');
        assert_eq!(config.encoding, Encoding::Utf8);
        assert_eq!(config.marker_path, PathBuf::from("/tmp/receita/info.txt"));
    }

    #[test]
    fn test_settings_reject_zero_batch() {
        let settings = Settings::from_toml_str("[pipeline]\nbatch_size = 0\n").unwrap();
        assert!(settings.pipeline_config().is_err());
    }

    #[test]
    fn test_settings_custom_layouts() {
        let settings = Settings::from_toml_str(
            r#"
            [[layouts]]
            record_type = "PAISES"
            table = "tb_pais"
            columns = ["cd_pais", "st_pais"]

            [[indexes]]
            name = "ix_pais"
            table = "tb_pais"
            column = "cd_pais"
            "#,
        )
        .unwrap();
        let registry = settings.layout_registry().unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.indexes().len(), 1);
    }

    #[test]
    fn test_settings_default_registry() {
        let registry = Settings::default().layout_registry().unwrap();
        assert_eq!(registry.len(), 10);
    }

    #[test]
    fn test_settings_unknown_key_rejected() {
        assert!(Settings::from_toml_str("[pipeline]\nbatchsize = 10\n").is_err());
    }

    #[test]
    fn test_load_settings_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_settings(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_load_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receita.toml");
        std::fs::write(&path, "[publisher]\nindex_url = \"http://localhost/idx\"\n").unwrap();
        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.publisher_config().index_url, "http://localhost/idx");
    }
}
