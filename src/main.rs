use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use memoranda::core::config::{AppPaths, Settings};
use memoranda::core::logging;
use memoranda::server::router;
use memoranda::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = AppPaths::new();
    logging::init(&paths);

    let settings = Settings::from_env();
    let state = AppState::initialize(&paths, settings.clone()).await?;

    let bind_addr = format!("127.0.0.1:{}", settings.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    let addr = listener.local_addr()?;
    tracing::info!("Listening on {}", addr);

    let app: Router = router::router(state);
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
