use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Optional: when unset the service runs in standalone mode against the
    /// in-memory store (nothing survives a restart).
    pub database_url: Option<String>,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    /// Applied when a job is created without an explicit limit.
    pub default_quota_limit: i64,
    /// Applications per screening batch. Clamped to the 200-CV contract
    /// ceiling of the scoring capability.
    pub screening_batch_capacity: usize,
    /// How long one scoring dispatch may run before it counts as failed.
    pub dispatch_timeout_secs: u64,
    /// Fingerprint time-bucket width. Larger windows dedup longer; smaller
    /// windows track less.
    pub fingerprint_window_hours: u32,
    /// Whether raising `quota_limit` reopens a job that already hit the
    /// hard cap, without requiring a reset.
    pub readmit_after_limit_raise: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: std::env::var("DATABASE_URL").ok(),
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            default_quota_limit: std::env::var("DEFAULT_QUOTA_LIMIT")
                .unwrap_or_else(|_| "200".to_string())
                .parse::<i64>()
                .context("DEFAULT_QUOTA_LIMIT must be a positive integer")?,
            screening_batch_capacity: std::env::var("SCREENING_BATCH_CAPACITY")
                .unwrap_or_else(|_| "200".to_string())
                .parse::<usize>()
                .context("SCREENING_BATCH_CAPACITY must be a positive integer")?,
            dispatch_timeout_secs: std::env::var("DISPATCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse::<u64>()
                .context("DISPATCH_TIMEOUT_SECS must be a positive integer")?,
            fingerprint_window_hours: std::env::var("FINGERPRINT_WINDOW_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse::<u32>()
                .context("FINGERPRINT_WINDOW_HOURS must be a positive integer")?,
            readmit_after_limit_raise: std::env::var("READMIT_AFTER_LIMIT_RAISE")
                .unwrap_or_else(|_| "true".to_string())
                .parse::<bool>()
                .context("READMIT_AFTER_LIMIT_RAISE must be true or false")?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}
