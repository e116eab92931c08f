use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
    pub ansi: bool,
    /// Used when `RUST_LOG` is not set.
    pub default_env_filter: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            ansi: true,
            default_env_filter: "info".to_string(),
        }
    }

    pub fn test(service_name: &str) -> Self {
        let mut config = Self::local_dev(service_name);
        config.default_env_filter = "debug".to_string();
        config
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("caravel")
    }
}

pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_env_filter.clone()));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(config.ansi)
            .init();
    }
}
