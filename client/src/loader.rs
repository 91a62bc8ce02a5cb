use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use urlencoding::encode;

use crate::{
    config::SyncConfig,
    error::MediaLoadError,
    media::{
        next_matching, race_timeout, EngineEvent, EngineErrorKind, EngineOptions, MediaEvent,
        Race, ReadyState, SubtitleTrack,
    },
    protocol::{Headers, RoomState, VideoChanged},
    session::{LoadedSource, PlaybackSession},
};

const LOG_TAG: &str = "[Loader]";

/// Container/delivery format of a media source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaFormat {
    Hls,
    Mp4,
    Webm,
    Native,
    /// Unrecognized hint, passed through untouched
    Other(String),
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hls => f.write_str("hls"),
            Self::Mp4 => f.write_str("mp4"),
            Self::Webm => f.write_str("webm"),
            Self::Native => f.write_str("native"),
            Self::Other(hint) => f.write_str(hint),
        }
    }
}

/// Work out the format from URL markers first, then the caller's hint
pub fn detect_format(url: &str, hint: &str) -> MediaFormat {
    let lower = url.to_ascii_lowercase();
    let hint = hint.trim();
    if lower.contains(".m3u8") || lower.contains("/hls/") || hint.eq_ignore_ascii_case("hls") {
        MediaFormat::Hls
    } else if lower.contains(".mp4") || lower.contains("/mp4/") || hint.eq_ignore_ascii_case("mp4")
    {
        MediaFormat::Mp4
    } else if lower.contains(".webm") || hint.eq_ignore_ascii_case("webm") {
        MediaFormat::Webm
    } else if hint.is_empty() || hint.eq_ignore_ascii_case("native") {
        MediaFormat::Native
    } else {
        MediaFormat::Other(hint.to_string())
    }
}

/// Same-origin proxy URL carrying the target and its request headers
pub fn build_proxy_url(config: &SyncConfig, url: &str, headers: &Headers) -> String {
    let mut params = vec![format!("url={}", encode(url))];
    if let Some(agent) = headers.user_agent() {
        params.push(format!("user_agent={}", encode(agent)));
    }
    if let Some(referer) = headers.referer() {
        params.push(format!("referer={}", encode(referer)));
    }
    format!("{}?{}", proxy_endpoint(config), params.join("&"))
}

/// The bare proxy endpoint. Without a `url` it answers 400 when enabled and
/// 503 when disabled, never touching an upstream.
pub fn proxy_endpoint(config: &SyncConfig) -> String {
    format!(
        "{}{}",
        config.proxy_base.trim_end_matches('/'),
        config.proxy_path
    )
}

/// Everything needed to load one source
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub url: String,
    /// Format hint from the server
    pub format: String,
    pub headers: Headers,
    pub title: String,
    pub subtitle_url: String,
}

impl From<&RoomState> for LoadRequest {
    fn from(state: &RoomState) -> Self {
        Self {
            url: state.video_url.clone(),
            format: state.video_format.clone(),
            headers: state.headers.clone(),
            title: state.video_title.clone(),
            subtitle_url: state.subtitle_url.clone(),
        }
    }
}

impl From<&VideoChanged> for LoadRequest {
    fn from(change: &VideoChanged) -> Self {
        Self {
            url: change.url.clone(),
            format: change.format.clone(),
            headers: change.headers.clone(),
            title: change.title.clone(),
            subtitle_url: change.subtitle_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub format: MediaFormat,
    pub route: Route,
    /// Physical attempts made, never more than two
    pub attempts: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Available,
    /// Server answered 503: proxying is switched off
    Disabled,
    Unreachable,
}

/// Lightweight check of the proxy endpoint, used to tell "proxy disabled"
/// apart from a plain fetch failure
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> ProxyStatus;
}

pub struct HttpProxyProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProxyProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ProxyProbe for HttpProxyProbe {
    async fn probe(&self, endpoint: &str) -> ProxyStatus {
        match self
            .client
            .head(endpoint)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                ProxyStatus::Disabled
            }
            Ok(_) => ProxyStatus::Available,
            Err(e) => {
                debug!("{LOG_TAG} proxy probe failed: {e}");
                ProxyStatus::Unreachable
            }
        }
    }
}

enum Attempt {
    Loaded,
    /// Recoverable on the direct route; try the proxy
    Fallback(String),
    Failed(String),
}

struct SourceFailure {
    attempts: u8,
    reason: String,
    proxied: bool,
}

/// Acquires a playable source through at most one direct and one proxied
/// attempt.
pub struct MediaSourceLoader {
    probe: Arc<dyn ProxyProbe>,
}

impl MediaSourceLoader {
    pub fn new(probe: Arc<dyn ProxyProbe>) -> Self {
        Self { probe }
    }

    /// Load `request` into the session's media element
    pub async fn load(
        &self,
        session: &PlaybackSession,
        request: &LoadRequest,
    ) -> Result<LoadReport, MediaLoadError> {
        let _ticket = session.begin_load()?;
        session.destroy_engine();

        let format = detect_format(&request.url, &request.format);
        info!("{LOG_TAG} loading {} as {format}", request.url);

        let outcome = if format == MediaFormat::Hls && session.engines().is_supported() {
            self.load_hls(session, request).await
        } else {
            self.load_native(session, request).await
        };

        let media = session.media();
        media.detach_subtitles();
        if !request.subtitle_url.is_empty() {
            media.attach_subtitle(SubtitleTrack {
                url: build_proxy_url(session.config(), &request.subtitle_url, &request.headers),
                label: "Subtitles".to_string(),
                language: "und".to_string(),
            });
        }

        match outcome {
            Ok((route, attempts)) => {
                session.finish_load(Some(LoadedSource {
                    url: request.url.clone(),
                    format: format.clone(),
                    title: request.title.clone(),
                }));
                Ok(LoadReport {
                    format,
                    route,
                    attempts,
                })
            }
            Err(failure) => {
                session.destroy_engine();
                session.finish_load(None);
                warn!(
                    "{LOG_TAG} giving up on {} after {} attempt(s): {}",
                    request.url, failure.attempts, failure.reason
                );
                if failure.proxied {
                    let endpoint = proxy_endpoint(session.config());
                    if self.probe.probe(&endpoint).await == ProxyStatus::Disabled {
                        return Err(MediaLoadError::ProxyDisabled);
                    }
                }
                Err(MediaLoadError::Exhausted {
                    attempts: failure.attempts,
                    reason: failure.reason,
                })
            }
        }
    }

    async fn load_hls(
        &self,
        session: &PlaybackSession,
        request: &LoadRequest,
    ) -> Result<(Route, u8), SourceFailure> {
        match hls_attempt(session, request, Route::Direct).await {
            Attempt::Loaded => Ok((Route::Direct, 1)),
            Attempt::Failed(reason) => Err(SourceFailure {
                attempts: 1,
                reason,
                proxied: false,
            }),
            Attempt::Fallback(reason) => {
                warn!("{LOG_TAG} direct HLS failed ({reason}), retrying through proxy");
                match hls_attempt(session, request, Route::Proxy).await {
                    Attempt::Loaded => Ok((Route::Proxy, 2)),
                    Attempt::Fallback(reason) | Attempt::Failed(reason) => Err(SourceFailure {
                        attempts: 2,
                        reason,
                        proxied: true,
                    }),
                }
            }
        }
    }

    async fn load_native(
        &self,
        session: &PlaybackSession,
        request: &LoadRequest,
    ) -> Result<(Route, u8), SourceFailure> {
        match native_attempt(session, request, Route::Direct).await {
            Attempt::Loaded => Ok((Route::Direct, 1)),
            Attempt::Fallback(reason) | Attempt::Failed(reason) => {
                warn!("{LOG_TAG} direct source failed ({reason}), retrying through proxy");
                match native_attempt(session, request, Route::Proxy).await {
                    Attempt::Loaded => Ok((Route::Proxy, 2)),
                    Attempt::Fallback(reason) | Attempt::Failed(reason) => Err(SourceFailure {
                        attempts: 2,
                        reason,
                        proxied: true,
                    }),
                }
            }
        }
    }
}

async fn hls_attempt(session: &PlaybackSession, request: &LoadRequest, route: Route) -> Attempt {
    let (load_url, options) = match route {
        Route::Direct => {
            let mut request_headers = Vec::new();
            if let Some(agent) = request.headers.user_agent() {
                request_headers.push(("X-Custom-User-Agent".to_string(), agent.to_string()));
            }
            if let Some(referer) = request.headers.referer() {
                request_headers.push(("X-Custom-Referer".to_string(), referer.to_string()));
            }
            (request.url.clone(), EngineOptions { request_headers })
        }
        Route::Proxy => (
            build_proxy_url(session.config(), &request.url, &request.headers),
            EngineOptions::default(),
        ),
    };
    debug!("{LOG_TAG} HLS {route:?} attempt");

    let engine = session.engines().create(options);
    let mut events = engine.subscribe();
    session.install_engine(Arc::clone(&engine));
    engine.load_source(&load_url);
    engine.attach_media();

    let manifest = async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::ManifestParsed) => return Attempt::Loaded,
                Ok(EngineEvent::Error {
                    fatal: true,
                    kind,
                    details,
                }) => {
                    return if route == Route::Direct && kind == EngineErrorKind::Network {
                        Attempt::Fallback(details)
                    } else {
                        Attempt::Failed(details)
                    };
                }
                Ok(EngineEvent::Error { details, .. }) => {
                    debug!("{LOG_TAG} non-fatal HLS error: {details}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Attempt::Failed("streaming engine went away".to_string());
                }
            }
        }
    };

    match route {
        Route::Direct => {
            match race_timeout(manifest, session.config().hls_manifest_timeout).await {
                Race::Event(attempt) => attempt,
                Race::TimedOut => {
                    session.destroy_engine();
                    Attempt::Fallback("no manifest before watchdog expired".to_string())
                }
            }
        }
        Route::Proxy => manifest.await,
    }
}

async fn native_attempt(
    session: &PlaybackSession,
    request: &LoadRequest,
    route: Route,
) -> Attempt {
    let load_url = match route {
        Route::Direct => request.url.clone(),
        Route::Proxy => build_proxy_url(session.config(), &request.url, &request.headers),
    };
    debug!("{LOG_TAG} native {route:?} attempt");

    let mut events = session.subscribe();
    session.media().set_source(&load_url);

    let is_settled = |e: &MediaEvent| matches!(e, MediaEvent::CanPlay | MediaEvent::Error(_));
    let settled = match race_timeout(
        next_matching(&mut events, is_settled),
        session.config().native_ready_poll,
    )
    .await
    {
        Race::Event(event) => event,
        Race::TimedOut if session.media().ready_state() >= ReadyState::HaveCurrentData => {
            return Attempt::Loaded;
        }
        Race::TimedOut => {
            let reason = "not ready after readiness poll".to_string();
            return match route {
                Route::Direct => Attempt::Fallback(reason),
                Route::Proxy => Attempt::Failed(reason),
            };
        }
    };

    match settled {
        Some(MediaEvent::CanPlay) => Attempt::Loaded,
        Some(MediaEvent::Error(reason)) if route == Route::Direct => Attempt::Fallback(reason),
        Some(MediaEvent::Error(reason)) => Attempt::Failed(reason),
        _ => Attempt::Failed("media element went away".to_string()),
    }
}
