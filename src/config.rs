//! Environment configuration.
//!
//! All knobs come from environment variables with development-friendly
//! defaults. Production deployments set at minimum `DATABASE_URL` (or the
//! `DB_*` parts) and `MARKETPLACE_A_SECRET`.

use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to (`PORT`, default 3000).
    pub listen_addr: SocketAddr,

    /// Postgres connection URL (`DATABASE_URL`, or composed from
    /// `DB_HOST`/`DB_PORT`/`DB_NAME`/`DB_USER`/`DB_PASSWORD`).
    pub database_url: String,

    /// Secret for Marketplace A webhook signatures (`MARKETPLACE_A_SECRET`).
    pub marketplace_a_secret: Vec<u8>,

    /// Base URL of the Marketplace B API (`MARKETPLACE_B_API`).
    pub marketplace_b_api: String,

    /// Bearer token for the Marketplace B API (`MARKETPLACE_B_API_KEY`).
    pub marketplace_b_api_key: String,

    /// Main repository pool size.
    pub db_max_connections: u32,

    /// How long a request waits for a pooled connection before failing fast.
    pub db_acquire_timeout: Duration,

    /// Idle connections are closed after this long.
    pub db_idle_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            let host = env_or("DB_HOST", "localhost");
            let port = env_or("DB_PORT", "5432");
            let name = env_or("DB_NAME", "inventory");
            let user = env_or("DB_USER", "postgres");
            let password = env_or("DB_PASSWORD", "");
            format!("postgres://{user}:{password}@{host}:{port}/{name}")
        });

        let marketplace_a_secret = std::env::var("MARKETPLACE_A_SECRET")
            .map(|s| s.into_bytes())
            .unwrap_or_else(|_| {
                tracing::warn!(
                    "MARKETPLACE_A_SECRET not set, using empty secret (INSECURE - for development only)"
                );
                Vec::new()
            });

        Config {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            database_url,
            marketplace_a_secret,
            marketplace_b_api: env_or("MARKETPLACE_B_API", "http://localhost:4000"),
            marketplace_b_api_key: env_or("MARKETPLACE_B_API_KEY", ""),
            db_max_connections: 20,
            db_acquire_timeout: Duration::from_secs(2),
            db_idle_timeout: Duration::from_secs(30),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
