use std::time::Duration;

/// Runtime configuration, read once at startup from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub timescale_host: String,
    pub timescale_port: u16,
    pub timescale_user: String,
    pub timescale_password: String,
    pub timescale_dbname: String,
    /// Point retention, mirrored from the database's retention policy.
    pub data_retention: Duration,
    pub tagset_cache_update_interval: Duration,
    pub tagset_cache_update_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub housekeeping_timeout: Duration,
    pub insert_metric_cache_size: usize,
    pub insert_tagset_cache_size: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            timescale_host: env_or("TIMESCALE_HOST", "localhost".to_string()),
            timescale_port: env_or("TIMESCALE_PORT", 5432),
            timescale_user: env_or("TIMESCALE_USER", "postgres".to_string()),
            timescale_password: env_or("TIMESCALE_PASSWORD", String::new()),
            timescale_dbname: env_or("TIMESCALE_DBNAME", "postgres".to_string()),
            data_retention: Duration::from_secs(env_or("DATA_RETENTION_DAYS", 30u64) * 86_400),
            tagset_cache_update_interval: Duration::from_secs(env_or(
                "TAGSET_CACHE_UPDATE_INTERVAL_SECONDS",
                30,
            )),
            tagset_cache_update_timeout: Duration::from_secs(env_or(
                "TAGSET_CACHE_UPDATE_TIMEOUT_SECONDS",
                300,
            )),
            housekeeping_interval: Duration::from_secs(env_or(
                "HOUSEKEEPING_INTERVAL_SECONDS",
                3600,
            )),
            housekeeping_timeout: Duration::from_secs(env_or("HOUSEKEEPING_TIMEOUT_SECONDS", 600)),
            insert_metric_cache_size: env_or("INSERT_METRIC_CACHE_SIZE", 65_536),
            insert_tagset_cache_size: env_or("INSERT_TAGSET_CACHE_SIZE", 2_097_152),
        }
    }

    /// TTL for cached metric/tagset ids. Held at half the retention period so
    /// a cached id can never outlive its row.
    pub fn cache_entry_ttl(&self) -> Duration {
        self.data_retention / 2
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.timescale_user,
            self.timescale_password,
            self.timescale_host,
            self.timescale_port,
            self.timescale_dbname,
        )
    }
}
