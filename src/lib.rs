pub mod aggregators;
pub mod cache;
pub mod config;
pub mod db;
pub mod downsample;
pub mod error;
pub mod filters;
pub mod handlers;
pub mod housekeeping;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod rate;
pub mod scheduler;

use sqlx::PgPool;
use std::sync::Arc;

use cache::TagsetCache;
use config::Config;
use ingest::Ingestor;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cache: Arc<TagsetCache>,
    pub ingestor: Arc<Ingestor>,
    pub config: Arc<Config>,
}
