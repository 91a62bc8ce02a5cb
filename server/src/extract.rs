use anyhow::{bail, Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::process::Command;

use crate::proxy::{error_response, AppState};

const LOG_TAG: &str = "[Extract]";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExtractQuery {
    pub url: String,
}

/// Playable source resolved from a page URL, shaped like a `video_change`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedVideo {
    pub url: String,
    pub format: String,
    pub title: String,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub user_agent: String,
    pub referer: String,
}

/// Subset of `yt-dlp -j` output we care about
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YtDlpInfo {
    url: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    protocol: Option<String>,
    ext: Option<String>,
    http_headers: HashMap<String, String>,
    requested_formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YtDlpFormat {
    url: Option<String>,
    protocol: Option<String>,
    ext: Option<String>,
    http_headers: HashMap<String, String>,
}

fn header(headers: &HashMap<String, String>, name: &str) -> String {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

/// Turn one `yt-dlp -j` document into an [`ExtractedVideo`]. Merged
/// video+audio selections fall back to the first requested format.
fn parse_info(json: &str) -> Result<ExtractedVideo> {
    let info: YtDlpInfo = serde_json::from_str(json).context("yt-dlp printed invalid JSON")?;
    let first = info.requested_formats.into_iter().next().unwrap_or_default();

    let Some(url) = info.url.or(first.url) else {
        bail!("yt-dlp returned no stream URL");
    };
    let protocol = info.protocol.or(first.protocol).unwrap_or_default();
    let ext = info.ext.or(first.ext).unwrap_or_default();
    let format = if protocol.contains("m3u8") || ext == "m3u8" {
        "hls".to_string()
    } else if ext.is_empty() {
        "native".to_string()
    } else {
        ext
    };
    let headers = if info.http_headers.is_empty() {
        first.http_headers
    } else {
        info.http_headers
    };

    Ok(ExtractedVideo {
        url,
        format,
        title: info.title.unwrap_or_default(),
        duration: info.duration,
        thumbnail: info.thumbnail,
        user_agent: header(&headers, "user-agent"),
        referer: header(&headers, "referer"),
    })
}

async fn run_ytdlp(binary: &str, url: &str) -> Result<ExtractedVideo> {
    let output = Command::new(binary)
        .args(["--no-warnings", "--no-playlist", "-f", "best", "-j", url])
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to execute {binary}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("yt-dlp failed: {}", stderr.trim());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
        bail!("No output from yt-dlp");
    };
    parse_info(line)
}

/// `GET /extract?url=`: resolve a page URL (YouTube and friends) to a
/// directly playable stream through yt-dlp.
pub async fn extract_video(
    State(state): State<AppState>,
    Query(query): Query<ExtractQuery>,
) -> Response {
    let url = query.url.trim();
    if url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url parameter is required");
    }

    match run_ytdlp(&state.ytdlp, url).await {
        Ok(video) => {
            tracing::info!("{LOG_TAG} {url} -> {} ({})", video.title, video.format);
            Json(video).into_response()
        }
        Err(e) => {
            tracing::warn!("{LOG_TAG} {url}: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not extract video info")
        }
    }
}
