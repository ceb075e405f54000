use std::{collections::HashSet, process::ExitCode};

use adaptive_bulk_loader::{
    config::Cli,
    loader::{BulkLoader, LoadSummary},
    store::cosmos::{CosmosRetryLogic, CosmosStore},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let default_log_filter = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_log_filter)),
        )
        .init();

    let cli = Cli::parse_args();
    match run(&cli).await {
        Ok(summary) => {
            println!("\n{summary}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "Load failed.");
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<LoadSummary, adaptive_bulk_loader::Error> {
    let plan = cli.load_plan()?;
    let settings = cli.to_settings();

    println!("Loading Data ...\n");
    let mut store = CosmosStore::connect(
        &cli.account,
        &cli.key,
        cli.database.trim(),
        cli.connection_policy(),
    )
    .await?;
    if let Some(path) = &cli.partition_key {
        store = store.with_partition_key(path);
    }

    let mut checked = HashSet::new();
    for target in &plan {
        if checked.insert(&target.collection) {
            store.ensure_collection(&target.collection).await?;
        }
    }

    info!(
        max_loaders = settings.max_loaders(),
        floor = settings.floor(),
        batch_size = settings.batch_size(),
        "Starting load."
    );
    let summary = BulkLoader::new(store, CosmosRetryLogic, settings)
        .run(&plan)
        .await?;
    Ok(summary)
}
