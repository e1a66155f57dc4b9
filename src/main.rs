use std::sync::Arc;

use anyhow::Context;
use feature_flag_service::config::{Config, StoreConfig};
use feature_flag_service::routes;
use feature_flag_service::service::FlagService;
use feature_flag_service::state::AppState;
use feature_flag_service::store::couchbase::CouchbaseStore;
use feature_flag_service::store::memory::MemoryStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let flags = match &config.store {
        StoreConfig::Memory => FlagService::with_store(Arc::new(MemoryStore::new())),
        StoreConfig::Couchbase(cb) => {
            let store = CouchbaseStore::new(cb.clone()).context("unable to initialize couchbase store")?;
            info!(keyspace = store.fqn(), "using couchbase flag store");
            FlagService::with_store(Arc::new(store))
        }
    };

    let state = AppState::new(flags, config.store.kind());

    let app = routes::routes().with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("unable to bind {}", config.addr()))?;

    info!(addr = %config.addr(), store = config.store.kind(), "feature flag service listening");

    axum::serve(listener, app).await?;
    Ok(())
}
