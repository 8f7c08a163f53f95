//! sqlgate server: `sqlgate config.Path=./services.hson bind=0.0.0.0:3000`

use sqlgate::{app, refresh, AppState, Settings, TdsExecutor};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sqlgate=info")),
        )
        .init();

    let settings = Settings::from_args(std::env::args().skip(1), |key| std::env::var(key).ok())?;
    let client = reqwest::Client::new();
    let initial = refresh::load_initial(&settings.source, &client).await;
    let state = AppState::new(initial, Arc::new(TdsExecutor::new()));

    tokio::spawn(refresh::run(
        state.clone(),
        settings.source.clone(),
        settings.refresh_interval,
    ));

    let router = app(state);
    let mut servers = Vec::with_capacity(settings.bind.len());
    for addr in &settings.bind {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("sqlgate listening on http://{}", listener.local_addr()?);
        servers.push(tokio::spawn(axum::serve(listener, router.clone()).into_future()));
    }
    for server in futures::future::join_all(servers).await {
        server??;
    }
    Ok(())
}
