use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use termgate::services::{
    InMemoryProfileStore, StaticTokenAuth, TracingHistorySink, WindowRateLimiter,
};
use termgate::{EngineConfig, Gateway, Services};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let token = match std::env::var("TERMGATE_AUTH_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => {
            error!("TERMGATE_AUTH_TOKEN must be set");
            std::process::exit(1);
        }
    };

    let services = Services {
        auth: Arc::new(StaticTokenAuth::new(token)),
        profiles: Arc::new(load_profiles()),
        history: Arc::new(TracingHistorySink),
        rate_limiter: Arc::new(WindowRateLimiter::new(config.messages_per_minute)),
    };

    let gateway = match Gateway::bind(config, services).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            std::process::exit(1);
        }
    };
    let registry = gateway.registry();

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!("Gateway terminated: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    registry.shutdown().await;
    info!("Termgate stopped");
}

/// SSH profiles from `TERMGATE_PROFILES` (JSON map of profile id to
/// profile), when set.
fn load_profiles() -> InMemoryProfileStore {
    let store = InMemoryProfileStore::new();

    if let Ok(raw) = std::env::var("TERMGATE_PROFILES") {
        match serde_json::from_str::<std::collections::HashMap<String, termgate::transport::SshProfile>>(&raw) {
            Ok(profiles) => {
                for (id, profile) in profiles {
                    info!("Loaded ssh profile {} ({})", id, profile.host);
                    store.insert(id, profile);
                }
            }
            Err(e) => {
                error!("Failed to parse TERMGATE_PROFILES: {}", e);
                std::process::exit(1);
            }
        }
    }

    store
}
