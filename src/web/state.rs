use crate::catalog::SchemaSnapshot;
use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use std::sync::Arc;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Pipeline,
    pub snapshot: Arc<SchemaSnapshot>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Pipeline, snapshot: Arc<SchemaSnapshot>) -> Self {
        Self {
            config,
            pipeline,
            snapshot,
            startup_time: chrono::Utc::now(),
        }
    }
}
