use clap::{Args, Parser, Subcommand, ValueEnum};
use receita_core::config::{DbConfig, PipelineConfig, PublisherConfig, Settings};
use receita_core::error::AppError;
use receita_core::pipeline::RunOptions;
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "receita")]
#[command(
    author,
    version,
    about = "Bulk loader for the CNPJ open-data release"
)]
#[command(after_help = "Examples:
  receita run                          # daily routine: check, download, load
  receita run --truncate --index       # full reload with lookup indexes
  receita run --no-upload              # only stage the archives
  receita run --only Simples.zip --truncate
                                       # reload a single archive
  receita catalog --format json
  receita status")]
pub struct Config {
    /// PostgreSQL connection URL, optionally with ?schema=<name>
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Publisher index page listing the release archives
    #[arg(long, env = "RECEITA_INDEX_URL", global = true)]
    pub index_url: Option<String>,

    /// Directory for downloaded archives, the marker and the ledger
    #[arg(long, env = "RECEITA_STAGING_DIR", global = true, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Settings file [default: <config dir>/receita/receita.toml]
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Maximum database connections in the pool
    #[arg(long, global = true, default_value = "5")]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daily routine once
    Run(RunArgs),
    /// Print the current release and how each archive would be loaded
    Catalog {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Create the lookup indexes
    Index,
    /// Print the stored marker and the completion ledger
    Status {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Print the active record layouts
    Layouts,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Use the archives already staged instead of downloading
    #[arg(long)]
    pub no_download: bool,

    /// Download only; do not load the database
    #[arg(long)]
    pub no_upload: bool,

    /// Create the lookup indexes after loading
    #[arg(long)]
    pub index: bool,

    /// Recreate every target table before loading
    #[arg(long)]
    pub truncate: bool,

    /// Run even if the release has not changed
    #[arg(long)]
    pub force: bool,

    /// Process only this archive (repeatable); the marker is left as is
    #[arg(long, value_name = "NAME")]
    pub only: Vec<String>,

    /// Archives processed at the same time
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Rows per bulk insert
    #[arg(long, value_name = "ROWS")]
    pub batch_size: Option<usize>,

    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

impl RunArgs {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            download: !self.no_download,
            upload: !self.no_upload,
            index_base: self.index,
            first_upload_truncate: self.truncate,
            force: self.force,
        }
    }
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// Pretty-printed JSON
    Json,
}

impl Config {
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            max_connections: self.max_connections,
        }
    }

    /// Publisher settings from the file, with the command line on top.
    pub fn publisher_config(&self, settings: &Settings) -> PublisherConfig {
        let mut publisher = settings.publisher_config();
        if let Some(url) = &self.index_url {
            publisher.index_url = url.clone();
        }
        publisher
    }

    /// Pipeline settings from the file, with the command line on top.
    pub fn pipeline_config(&self, settings: &Settings) -> Result<PipelineConfig, AppError> {
        let mut pipeline = settings.pipeline_config()?;

        if let Some(dir) = &self.staging_dir {
            let relocated = PipelineConfig::with_staging_dir(dir);
            pipeline.staging_dir = relocated.staging_dir;
            pipeline.marker_path = relocated.marker_path;
            pipeline.ledger_path = relocated.ledger_path;
        }
        if let Command::Run(args) = &self.command {
            if let Some(concurrency) = args.concurrency {
                pipeline.concurrency = concurrency;
            }
            if let Some(batch_size) = args.batch_size {
                pipeline.batch_size = batch_size;
            }
        }

        receita_core::config::validate_pipeline(&pipeline)?;
        Ok(pipeline)
    }
}
