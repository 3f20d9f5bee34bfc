use clap::Parser;
use r2d2::Pool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod audit;
mod catalog;
mod config;
mod db;
mod error;
mod guard;
mod llm;
mod pipeline;
mod util;
mod web;

use crate::audit::AuditRecorder;
use crate::catalog::SchemaSnapshot;
use crate::config::{AppConfig, CliArgs};
use crate::db::db_pool::ReadOnlyConnectionManager;
use crate::db::executor::DuckDbExecutor;
use crate::llm::LlmManager;
use crate::pipeline::Pipeline;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Load the pinned schema catalog snapshot
    info!("Loading schema catalog from {}", config.catalog.path);
    let snapshot = Arc::new(SchemaSnapshot::load(Path::new(&config.catalog.path))?);
    info!(
        "Catalog version {} with {} tables",
        snapshot.version,
        snapshot.tables.len()
    );

    // Ensure the audit sink's directory exists
    if let Some(parent) = Path::new(&config.audit.path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating audit directory: {}", parent.display());
            std::fs::create_dir_all(parent)?;
        }
    }

    info!("Initializing read-only DuckDB connection pool");
    let manager = ReadOnlyConnectionManager::new(config.database.path.clone());
    let pool = Pool::builder()
        .max_size(config.database.pool_size)
        .connection_timeout(Duration::from_millis(config.database.acquire_timeout_ms))
        .build(manager)?;

    // Initialize LLM manager
    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm = LlmManager::new(&config.llm)?;

    let pipeline = Pipeline::new(
        llm,
        Box::new(DuckDbExecutor::new(pool)),
        AuditRecorder::new(
            &config.audit.path,
            Duration::from_millis(config.audit.write_timeout_ms),
        ),
        Arc::clone(&snapshot),
        config.guard.clone(),
        Duration::from_millis(config.database.query_timeout_ms),
        Duration::from_millis(config.database.long_query_timeout_ms),
    );

    let state = Arc::new(AppState::new(config.clone(), pipeline, snapshot));

    // Start the web server
    info!("Starting barql server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(std::io::Error::other(e.to_string()).into());
        }
    }

    Ok(())
}
