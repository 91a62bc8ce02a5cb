use std::{env, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use tandem_client::{
    constants::{LOCAL_WS_URL, VERSION},
    headless::{HeadlessEngineFactory, HeadlessPlayer, LogObserver},
    loader::HttpProxyProbe,
    utils::{format_time, guest_identity, http_origin_from_ws},
    ConnectionStatus, MediaElement, SyncConfig, SyncOrchestrator,
};
use tokio::sync::watch;
use url::Url;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);

struct Args {
    room_url: String,
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_client=debug,info".into()),
        )
        .init();

    let args = parse_args();
    let room = Url::parse(&args.room_url).context("Invalid room URL")?;
    if !matches!(room.scheme(), "ws" | "wss") {
        bail!("Room URL must use ws:// or wss://, got {}", room.scheme());
    }

    let mut config = SyncConfig::from_env();
    if env::var("TANDEM_PROXY_BASE").is_err() {
        if let Some(origin) = http_origin_from_ws(room.as_str()) {
            config.proxy_base = origin;
        }
    }
    let config = Arc::new(config);
    tracing::info!("Tandem follower v{VERSION}, proxy at {}", config.proxy_base);

    let client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    warm_up_backend(&client, &config.proxy_base).await;

    let player = HeadlessPlayer::new(client.clone());
    let orchestrator = SyncOrchestrator::new(
        Arc::clone(&config),
        player.clone(),
        Arc::new(HeadlessEngineFactory::new(player.clone(), client)),
        Arc::new(HttpProxyProbe::new(config.proxy_probe_timeout)),
        Arc::new(LogObserver::new(player.clone())),
    );

    let (name, avatar) = match args.name {
        Some(name) => (name, "🎬".to_string()),
        None => guest_identity(),
    };
    orchestrator
        .run(room.as_str(), &name, &avatar)
        .await
        .with_context(|| format!("Failed to join room at {room}"))?;

    let status = orchestrator.transport().status();
    let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    tokio::pin! {
        let failed = wait_for_failure(status);
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Leaving room");
                break;
            }
            _ = &mut failed => bail!("Connection to {room} was lost"),
            _ = ticker.tick() => {
                tracing::info!(
                    "{} at {} (rate {:.2})",
                    orchestrator.session().state(),
                    format_time(player.current_time()),
                    player.playback_rate()
                );
            }
        }
    }

    orchestrator.transport().close();
    Ok(())
}

fn parse_args() -> Args {
    let mut args = env::args().skip(1);
    let mut room_url = None;
    let mut name = None;
    while let Some(arg) = args.next() {
        if arg == "--name" {
            name = args.next();
        } else if arg == "--room" {
            room_url = args.next();
        } else if arg.starts_with("ws://") || arg.starts_with("wss://") {
            room_url = Some(arg);
        }
    }
    Args {
        room_url: room_url.unwrap_or_else(|| LOCAL_WS_URL.to_string()),
        name,
    }
}

async fn wait_for_failure(mut status: watch::Receiver<ConnectionStatus>) {
    while status.changed().await.is_ok() {
        if *status.borrow_and_update() == ConnectionStatus::Failed {
            return;
        }
    }
    std::future::pending::<()>().await;
}

async fn warm_up_backend(client: &reqwest::Client, origin: &str) {
    let health_url = format!("{origin}/healthz");
    match client
        .get(&health_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) => {
            tracing::info!("Warmup request to {} returned {}", health_url, response.status());
        }
        Err(e) => {
            tracing::warn!("Warmup request to {} failed: {}", health_url, e);
        }
    }
}
