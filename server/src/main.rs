use axum::{routing::get, Router};
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;

mod extract;
mod playlist;
mod proxy;

use extract::extract_video;
use proxy::{health_check, stream_proxy, AppState, PROXY_PATH};

fn proxy_enabled_from_env() -> bool {
    match env::var("TANDEM_PROXY_ENABLED") {
        Ok(val) => !matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "false" | "0" | "no" | "off"
        ),
        Err(_) => true,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3005);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let mut app_state = AppState::new(proxy_enabled_from_env())?;
    if let Ok(binary) = env::var("TANDEM_YTDLP") {
        app_state = app_state.with_ytdlp(binary);
    }
    if !app_state.proxy_enabled {
        tracing::warn!("Stream proxy is disabled, {PROXY_PATH} will answer 503");
    }

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route(PROXY_PATH, get(stream_proxy))
        .route("/extract", get(extract_video))
        .with_state(app_state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Tandem proxy listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
