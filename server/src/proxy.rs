use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::playlist::{is_playlist, rewrite_playlist};

const LOG_TAG: &str = "[Proxy]";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);
pub const PROXY_PATH: &str = "/proxy";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                  (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

#[derive(Clone)]
pub struct AppState {
    pub proxy_enabled: bool,
    /// yt-dlp binary used by `/extract`
    pub ytdlp: String,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(proxy_enabled: bool) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;
        Ok(Self {
            proxy_enabled,
            ytdlp: "yt-dlp".to_string(),
            http,
        })
    }

    pub fn with_ytdlp(mut self, binary: impl Into<String>) -> Self {
        self.ytdlp = binary.into();
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProxyQuery {
    pub url: String,
    pub user_agent: String,
    pub referer: String,
}

pub fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    let detail = detail.into();
    tracing::warn!("{LOG_TAG} {status}: {detail}");
    (status, Json(serde_json::json!({ "detail": detail }))).into_response()
}

/// `GET /proxy?url=&user_agent=&referer=`: fetch a remote media resource on
/// the caller's behalf, rewriting HLS playlists so follow-up requests come
/// back through here.
pub async fn stream_proxy(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> Response {
    if !state.proxy_enabled {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Proxy is disabled");
    }
    let url = query.url.trim();
    if url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url parameter is required");
    }

    let user_agent = if query.user_agent.is_empty() {
        DEFAULT_USER_AGENT
    } else {
        query.user_agent.as_str()
    };
    let mut request = state
        .http
        .get(url)
        .header(reqwest::header::ACCEPT, "*/*")
        .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
        .header(reqwest::header::USER_AGENT, user_agent);
    if !query.referer.is_empty() {
        request = request.header(reqwest::header::REFERER, query.referer.as_str());
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Proxy error: {e}"))
        }
    };
    if upstream.status().as_u16() != 200 {
        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        return error_response(status, format!("Upstream error: {}", upstream.status()));
    }

    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Proxy error: {e}"))
        }
    };

    let (content_type, body) = if is_playlist(&content_type, url) {
        let text = String::from_utf8_lossy(&body);
        let rewritten = rewrite_playlist(&text, url, &query.user_agent, &query.referer, PROXY_PATH);
        tracing::debug!("{LOG_TAG} rewrote playlist {url}");
        (PLAYLIST_CONTENT_TYPE.to_string(), rewritten.into_bytes())
    } else {
        (content_type, body.to_vec())
    };

    let content_type = HeaderValue::from_str(&content_type)
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, OPTIONS"),
            ),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*")),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ),
        ],
        body,
    )
        .into_response()
}

pub async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    use super::*;

    /// Upstream answering every request with a fixed response; forwards the
    /// raw request head to the returned channel.
    async fn upstream(
        status: &'static str,
        content_type: &'static str,
        body: &'static str,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let n = tcp.read(&mut buf).await.unwrap_or(0);
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = tcp.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{addr}"), rx)
    }

    fn query(url: &str) -> Query<ProxyQuery> {
        Query(ProxyQuery {
            url: url.to_string(),
            ..ProxyQuery::default()
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_proxy_answers_503() {
        let state = AppState::new(false).unwrap();
        let response = stream_proxy(State(state), query("https://x/v.m3u8")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_missing_url_is_rejected() {
        let state = AppState::new(true).unwrap();
        let response = stream_proxy(State(state), query("  ")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_playlist_is_rewritten_and_headers_forwarded() {
        let (origin, mut requests) = upstream(
            "200 OK",
            "application/x-mpegURL",
            "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n",
        )
        .await;
        let state = AppState::new(true).unwrap();
        let url = format!("{origin}/live/index");

        let response = stream_proxy(
            State(state),
            Query(ProxyQuery {
                url: url.clone(),
                user_agent: String::new(),
                referer: "https://ref.example/".into(),
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let body = body_text(response).await;
        let segment = body.lines().nth(2).unwrap();
        assert!(segment.starts_with("/proxy?url=http%3A%2F%2F127.0.0.1%3A"));
        assert!(segment.contains("%2Flive%2Fseg0.ts"));
        assert!(segment.ends_with("&referer=https%3A%2F%2Fref.example%2F"));

        let head = requests.recv().await.unwrap().to_ascii_lowercase();
        assert!(head.contains("user-agent: mozilla/5.0"));
        assert!(head.contains("referer: https://ref.example/"));
    }

    #[tokio::test]
    async fn test_binary_content_passes_through() {
        let (origin, _requests) = upstream("200 OK", "video/mp2t", "TSDATA").await;
        let state = AppState::new(true).unwrap();

        let response = stream_proxy(State(state), query(&format!("{origin}/seg0.ts"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(body_text(response).await, "TSDATA");
    }

    #[tokio::test]
    async fn test_upstream_status_is_forwarded() {
        let (origin, _requests) = upstream("404 Not Found", "text/plain", "").await;
        let state = AppState::new(true).unwrap();

        let response = stream_proxy(State(state), query(&format!("{origin}/gone.m3u8"))).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_500() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let state = AppState::new(true).unwrap();

        let response = stream_proxy(State(state), query(&format!("http://{addr}/v.mp4"))).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("Proxy error"));
    }
}
