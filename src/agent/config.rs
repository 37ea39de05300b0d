use std::time::Duration;

const DEFAULT_DATABASE_PATH: &str = "/var/lib/cirrus/cirrus.db";
const DEFAULT_NODE_ID: &str = "local";
const DEFAULT_INTERVAL_SECS: u64 = 10;
const DEFAULT_RECOVER_PAUSE_SECS: u64 = 10;
const DEFAULT_RECOVER_ATTEMPTS: u32 = 3;

/// Agent configuration, environment-driven with working defaults.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub database_path: String,
    /// Pause between reconcile passes.
    pub interval: Duration,
    /// Pause between recovery attempts after a failed pass.
    pub recover_pause: Duration,
    pub recover_attempts: u32,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let node_id = std::env::var("CIRRUS_NODE_ID")
            .unwrap_or_else(|_| DEFAULT_NODE_ID.to_string());
        let database_path = std::env::var("CIRRUS_DB_PATH")
            .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());

        let interval_secs: u64 = std::env::var("CIRRUS_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        let recover_pause_secs: u64 = std::env::var("CIRRUS_RECOVER_PAUSE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECOVER_PAUSE_SECS);
        let recover_attempts: u32 = std::env::var("CIRRUS_RECOVER_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECOVER_ATTEMPTS);

        Self {
            node_id,
            database_path,
            interval: Duration::from_secs(interval_secs),
            recover_pause: Duration::from_secs(recover_pause_secs),
            recover_attempts,
        }
    }
}
