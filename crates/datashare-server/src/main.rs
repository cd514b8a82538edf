mod cli;

use std::{path::Path, sync::Arc};

use clap::Parser;
use datashare_batch::{
    BatchSearchRepository, BatchSearchRunner, FsBatchSearchRepository, QueueSignal,
    ResumeController, SearchIndex,
};
use datashare_common::{error::DatashareError, types::Project};
use datashare_index::ElasticsearchIndex;
use datashare_session::{MemorySessionStore, SessionStore, UserRecord};
use datashare_web::{WebState, api_router};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env().add_directive("datashare=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    cli.validate()?;
    let batch_config = cli.batch_config();
    let resume_config = cli.resume_config();
    let web_config = cli.web_config();
    web_config.validate()?;

    tokio::fs::create_dir_all(&cli.data_dir).await?;
    let repository: Arc<dyn BatchSearchRepository> =
        Arc::new(FsBatchSearchRepository::new(cli.data_dir.join("batch")).await?);
    let index: Arc<dyn SearchIndex> = Arc::new(ElasticsearchIndex::new(&cli.index_config())?);

    let default_project = cli
        .default_project
        .clone()
        .map(Project::new)
        .unwrap_or_else(|| web_config.local_user().default_project());
    if let Err(err) = index.create_index(&default_project.name).await {
        warn!(index = %default_project, error = %err, "failed to create default project index");
    }

    let sessions = Arc::new(MemorySessionStore::new(cli.session_ttl()));
    if let Some(users_file) = cli.users_file.as_deref() {
        let seeded = seed_users(&sessions, users_file).await?;
        info!(count = seeded, path = %users_file.display(), "loaded users");
    }

    let resume = Arc::new(ResumeController::new(
        Arc::clone(&repository),
        resume_config,
    )?);
    let requeued = resume.resume_on_startup().await?;
    if !requeued.is_empty() {
        info!(batches = ?requeued, "requeued batch searches left running by a previous run");
    }

    let signal = QueueSignal::new();
    let runner = Arc::new(BatchSearchRunner::new(
        Arc::clone(&repository),
        index,
        batch_config,
        signal.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = tokio::spawn(Arc::clone(&runner).run_until_shutdown(shutdown_rx.clone()));
    let sweeper = {
        let resume = Arc::clone(&resume);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { resume.run_loop(shutdown).await })
    };
    info!(
        node = %runner.config().node_id,
        workers = runner.config().workers,
        "batch search workers started"
    );

    let state = WebState::new(
        repository,
        sessions as Arc<dyn SessionStore>,
        signal,
        web_config,
    )?;
    let app = api_router(Arc::new(state));

    let addr = cli.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("datashare server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, waiting for running batch searches to finish");
    let _ = shutdown_tx.send(true);
    for (name, joined) in [("workers", workers.await), ("resume sweeper", sweeper.await)] {
        if let Err(err) = joined {
            error!(task = name, error = %err, "background task failed");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        futures::future::pending::<()>().await;
    }
}

async fn seed_users(sessions: &MemorySessionStore, path: &Path) -> Result<usize, DatashareError> {
    let data = tokio::fs::read(path).await?;
    let records: Vec<UserRecord> = serde_json::from_slice(&data).map_err(|err| {
        DatashareError::InvalidArgument(format!(
            "failed to parse users file {}: {err}",
            path.display()
        ))
    })?;
    let count = records.len();
    for record in records {
        sessions.seed(record).await?;
    }
    Ok(count)
}
