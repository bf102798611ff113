// Server configuration
//
// Everything comes from the environment (after `.env` is loaded by main).
// Engine tuning lives in `EngineConfig::from_env` next to the engine itself.

use std::env;

/// HTTP server and storage settings
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    /// PostgreSQL connection string; in-memory storage when unset
    pub database_url: Option<String>,

    /// Maximum connections in the PostgreSQL pool
    pub database_max_connections: u32,

    /// Socket address the HTTP server binds to
    pub bind_addr: String,

    /// Origins allowed by CORS; same-origin only when empty
    pub cors_allowed_origins: Vec<String>,

    /// Run the queue worker pool inside the API process
    pub run_workers: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            bind_addr: "0.0.0.0:9000".to_string(),
            cors_allowed_origins: Vec::new(),
            run_workers: true,
        }
    }
}

impl ApiConfig {
    /// Load from environment variables
    ///
    /// - `DATABASE_URL`
    /// - `DATABASE_MAX_CONNECTIONS` (default 10)
    /// - `BIND_ADDR` (default `0.0.0.0:9000`)
    /// - `CORS_ALLOWED_ORIGINS`, comma separated
    /// - `BLOCKFLOW_RUN_WORKERS` (default `true`)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .ok()
                .map(|s| parse_origins(&s))
                .unwrap_or_default(),
            run_workers: env::var("BLOCKFLOW_RUN_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.run_workers),
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_cors_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_allowed_origins = origins;
        self
    }

    pub fn with_run_workers(mut self, run: bool) -> Self {
        self.run_workers = run;
        self
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
