use axum::{Router, routing::get, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tsbridge::cache::TagsetCache;
use tsbridge::config::Config;
use tsbridge::ingest::Ingestor;
use tsbridge::{AppState, db, handlers, housekeeping, scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("tsbridge=debug,tower_http=debug")
        }))
        .init();

    let config = Arc::new(Config::from_env());
    let pool = db::connect(&config).await?;
    let cache = Arc::new(TagsetCache::new());

    // Warm the cache before serving so the first queries see real tagsets.
    match tokio::time::timeout(config.tagset_cache_update_timeout, cache.refresh(&pool)).await {
        Ok(Ok(())) => tracing::info!("tagset cache warmed"),
        Ok(Err(e)) => tracing::warn!("initial tagset cache refresh failed: {e:#}"),
        Err(_) => tracing::warn!("initial tagset cache refresh timed out"),
    }

    {
        let pool = pool.clone();
        let cache = cache.clone();
        scheduler::spawn_periodic(
            "tagset-cache-refresh",
            config.tagset_cache_update_interval,
            config.tagset_cache_update_timeout,
            0.2,
            move || {
                let pool = pool.clone();
                let cache = cache.clone();
                async move { cache.refresh(&pool).await }
            },
        );
    }
    {
        let pool = pool.clone();
        let cache = cache.clone();
        let retention = config.data_retention;
        scheduler::spawn_periodic(
            "housekeeping",
            config.housekeeping_interval,
            config.housekeeping_timeout,
            0.2,
            move || housekeeping::run_cycle(pool.clone(), cache.clone(), retention),
        );
    }

    let state = AppState {
        ingestor: Arc::new(Ingestor::new(&config)),
        pool,
        cache,
        config,
    };

    let app = Router::new()
        .route("/api/put", post(handlers::put::put))
        .route("/api/query", post(handlers::query::query))
        .route("/api/query/last", post(handlers::query::query_last))
        .route("/api/search/lookup", post(handlers::lookup::lookup))
        .route("/api/suggest", get(handlers::suggest::suggest))
        .route(
            "/api/suggest/tagKeys/{metric}",
            get(handlers::suggest::suggest_tag_keys),
        )
        .route(
            "/api/suggest/tagValues/{tagKey}",
            get(handlers::suggest::suggest_tag_values),
        )
        .route("/api/health", get(handlers::health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 4242));
    tracing::info!("tsbridge listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
