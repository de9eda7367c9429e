use crate::error::{AppError, Result};

/// Markets diffed and persisted per sub-batch.
pub const DEFAULT_MARKET_BATCH_SIZE: usize = 100;

/// Selection rows per upsert statement. Kept well under SQLite's bound-parameter limit.
pub const DEFAULT_SELECTION_BATCH_SIZE: usize = 500;

/// SQLite's default cap on bound parameters in one statement.
pub const SQLITE_MAX_BIND_PARAMS: usize = 32_766;

/// Bound parameters per row in the widest upsert (the history tables).
pub const HISTORY_BINDS_PER_ROW: usize = 15;

/// Largest accepted market or selection batch size.
pub const MAX_BATCH_SIZE: usize = SQLITE_MAX_BIND_PARAMS / HISTORY_BINDS_PER_ROW;

/// How far back the snapshot cache prefetches history rows.
pub const DEFAULT_CACHE_WINDOW_DAYS: i64 = 7;

pub const SECS_PER_DAY: i64 = 86_400;

/// Upper bound on a single `POST /ingest` body.
pub const MAX_INGEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Markets per sub-batch (INGEST_MARKET_BATCH_SIZE)
    pub market_batch_size: usize,
    /// Selection rows per upsert (INGEST_SELECTION_BATCH_SIZE)
    pub selection_batch_size: usize,
    /// Snapshot cache prefetch window in days (INGEST_CACHE_WINDOW_DAYS)
    pub cache_window_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "ingest.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            market_batch_size: batch_size_var(
                "INGEST_MARKET_BATCH_SIZE",
                DEFAULT_MARKET_BATCH_SIZE,
            )?,
            selection_batch_size: batch_size_var(
                "INGEST_SELECTION_BATCH_SIZE",
                DEFAULT_SELECTION_BATCH_SIZE,
            )?,
            cache_window_days: std::env::var("INGEST_CACHE_WINDOW_DAYS")
                .ok()
                .map(|v| v.parse::<i64>())
                .transpose()
                .map_err(|_| {
                    AppError::Config("INGEST_CACHE_WINDOW_DAYS must be an integer".to_string())
                })?
                .unwrap_or(DEFAULT_CACHE_WINDOW_DAYS),
        })
    }

    pub fn cache_window_secs(&self) -> i64 {
        self.cache_window_days.saturating_mul(SECS_PER_DAY)
    }
}

fn batch_size_var(name: &str, default: usize) -> Result<usize> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    parse_batch_size(name, &raw)
}

fn parse_batch_size(name: &str, raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(AppError::Config(format!("{name} must be greater than zero"))),
        Ok(n) if n > MAX_BATCH_SIZE => Err(AppError::Config(format!(
            "{name} must be at most {MAX_BATCH_SIZE}"
        ))),
        Ok(n) => Ok(n),
        Err(_) => Err(AppError::Config(format!("{name} must be a positive integer"))),
    }
}
