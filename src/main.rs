use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stream_chat_service::{AppConfig, AppState, MemoryStore, ModelRegistry, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        ?config.listen_addr,
        backends = config.backends.len(),
        uploads_dir = %config.uploads_dir.display(),
        "starting chat service"
    );

    let models = Arc::new(ModelRegistry::from_config(config.as_ref()));
    models.preload(&config.preload).await;

    let state = AppState::new(config.clone(), models, Arc::new(MemoryStore::new()));
    let router = build_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "chat server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

/// Crate and request logs at info, the HTTP stack quieter. `RUST_LOG` wins.
const DEFAULT_LOG_FILTER: &str = "stream_chat_service=info,tower_http=info,hyper=warn,warn";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true).compact())
        .init();
}
