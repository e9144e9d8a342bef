pub mod config;

pub use config::{
    AppConfig, ChainConfig, ConfigError, Environment, ReconcileConfig, RetryPolicy, Secret,
    SyncConfig, WebhookSecrets,
};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://invoice-sync.db?mode=rwc";

/// Loads environment variables from `.env` when available.
///
/// Missing files are ignored so the function is safe in production builds
/// where dotenv files are not deployed.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}
