use anyhow::{Context, Result, anyhow};
use clap::Parser;
use event_schemas::EventSchemaManager;
use o11y::O11yConfig;
use runner::{feed_lines, open_store, version};
use schemawatch_config::{AppConfig, load_from_path};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "schemawatch", version = version::VERSION)]
#[command(about = "Infer, sample and persist event schemas from batches on stdin")]
struct Args {
    /// YAML config file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => load_from_path(path)?,
        None => AppConfig::default(),
    };

    o11y::init_all(&O11yConfig::from_app(&cfg.logging, &cfg.metrics))
        .map_err(|e| anyhow!("initialising observability: {e}"))?;
    info!(
        version = version::GIT_VERSION,
        commit = version::GIT_HASH,
        config = ?args.config,
        "schemawatch starting"
    );

    let store = open_store(&cfg.store)?;
    let cancel = CancellationToken::new();
    let manager = EventSchemaManager::start(
        cfg.event_schemas.clone(),
        store,
        cancel.clone(),
    )
    .await
    .context("starting event schema manager")?;

    let ingest = manager.ingest_handle();
    let feed_cancel = cancel.clone();
    let mut feeder = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        feed_lines(stdin, &ingest, &feed_cancel).await
    });

    tokio::select! {
        res = &mut feeder => match res {
            Ok(Ok(stats)) => info!(
                submitted = stats.submitted,
                skipped = stats.skipped,
                "input exhausted"
            ),
            Ok(Err(e)) => error!(error = %e, "reading input failed"),
            Err(e) => error!(error = %e, "input task failed"),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    cancel.cancel();
    let stats = manager.registry().stats().await;
    let report = manager.shutdown().await.context("final flush")?;
    info!(
        hot_models = stats.hot_models,
        cold_models = stats.cold_models,
        versions = stats.versions,
        flushed_models = report.models_written,
        flushed_versions = report.versions_written,
        "schemawatch stopped"
    );
    Ok(())
}
