use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use receita_cli::report::{render_catalog, render_layouts, render_status, render_summary};
use receita_cli::{Command, Config, OfflineStore, OutputFormat, RunArgs};
use receita_client::PublisherClient;
use receita_core::config::{HttpConfig, PipelineConfig, Settings};
use receita_core::layout::LayoutRegistry;
use receita_core::loader::TableStore;
use receita_core::pipeline::Pipeline;
use receita_core::progress::ProgressTracker;
use receita_core::{load_settings, AppError};
use receita_db::PgTableStore;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenv().ok();

    // Logs go to stderr so stdout only carries reports
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: cannot install logger: {}", e);
        return ExitCode::FAILURE;
    }

    let config = Config::parse();

    match execute(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<AppError>() {
                Some(app) => eprintln!("Error: {}", app.user_message()),
                None => eprintln!("Error: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

async fn execute(config: Config) -> anyhow::Result<()> {
    let settings = load_settings(config.config.as_deref()).context("Failed to load settings")?;
    let registry = Arc::new(
        settings
            .layout_registry()
            .context("Invalid layout configuration")?,
    );
    let pipeline_config = config.pipeline_config(&settings)?;

    match &config.command {
        Command::Run(args) => run(&config, &settings, registry, pipeline_config, args).await,
        Command::Catalog { format } => catalog(&config, &settings, &registry, *format).await,
        Command::Index => index(&config, &settings, registry, pipeline_config).await,
        Command::Status { format } => status(&pipeline_config, *format),
        Command::Layouts => {
            print!("{}", render_layouts(&registry));
            Ok(())
        }
    }
}

fn publisher(config: &Config, settings: &Settings) -> anyhow::Result<PublisherClient> {
    let client = PublisherClient::new(config.publisher_config(settings), HttpConfig::default())
        .context("Invalid publisher configuration")?;
    Ok(client)
}

async fn connect_store(config: &Config) -> anyhow::Result<PgTableStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required to load the database (or pass --no-upload)")?;
    let (pool, schema) = receita_db::connect(url, &config.db_config())
        .await
        .context("Failed to connect to database")?;
    Ok(PgTableStore::new(pool, schema))
}

/// Trips the token on Ctrl-C. The pipeline stops between batches.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            trigger.cancel();
        }
    });
    token
}

/// Run the daily routine
async fn run(
    config: &Config,
    settings: &Settings,
    registry: Arc<LayoutRegistry>,
    pipeline_config: PipelineConfig,
    args: &RunArgs,
) -> anyhow::Result<()> {
    let options = args.options();
    let source = publisher(config, settings)?;

    if options.upload {
        let store = connect_store(config).await?;
        drive(source, store, registry, pipeline_config, args).await
    } else {
        info!("Load stage disabled, no database connection needed");
        drive(source, OfflineStore, registry, pipeline_config, args).await
    }
}

async fn drive<S: TableStore>(
    source: PublisherClient,
    store: S,
    registry: Arc<LayoutRegistry>,
    pipeline_config: PipelineConfig,
    args: &RunArgs,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(source, store, registry, pipeline_config)
        .with_cancellation(cancel_on_interrupt());

    let summary = match pipeline.run_selected(args.options(), &args.only).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Run failed: {}", e);
            return Err(e.into());
        }
    };

    match args.format {
        OutputFormat::Text => print!("{}", render_summary(&summary)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}

/// Show the current release as published
async fn catalog(
    config: &Config,
    settings: &Settings,
    registry: &LayoutRegistry,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let release = publisher(config, settings)?.fetch_index().await?;

    match format {
        OutputFormat::Text => print!("{}", render_catalog(&release, registry)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&release)?),
    }
    Ok(())
}

/// Create the lookup indexes without loading anything
async fn index(
    config: &Config,
    settings: &Settings,
    registry: Arc<LayoutRegistry>,
    pipeline_config: PipelineConfig,
) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let pipeline = Pipeline::new(publisher(config, settings)?, store, registry, pipeline_config);
    pipeline.build_indexes().await?;
    info!("Indexes ready");
    Ok(())
}

/// Show the stored marker and the completion ledger
fn status(pipeline_config: &PipelineConfig, format: OutputFormat) -> anyhow::Result<()> {
    let tracker = ProgressTracker::open(&pipeline_config.marker_path, &pipeline_config.ledger_path)
        .context("Failed to read progress files")?;
    let marker = tracker.stored_marker();

    match format {
        OutputFormat::Text => print!("{}", render_status(marker.as_deref(), tracker.ledger())),
        OutputFormat::Json => {
            let value = serde_json::json!({
                "marker": marker,
                "ledger": tracker.ledger(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}
