use url::Url;
use uuid::Uuid;

const AVATARS: [&str; 8] = ["🦊", "🐻", "🐼", "🐨", "🐯", "🦁", "🐸", "🐙"];

/// Format seconds into MM:SS or HH:MM:SS
pub fn format_time(seconds: f64) -> String {
    let total_secs = seconds.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Throwaway display name and avatar for a follower that did not pick one
pub fn guest_identity() -> (String, String) {
    let id = Uuid::new_v4();
    let bytes = id.as_bytes();
    let avatar = AVATARS[bytes[0] as usize % AVATARS.len()];
    let suffix: String = id.simple().to_string().chars().take(4).collect();
    (format!("Guest-{suffix}"), avatar.to_string())
}

/// HTTP origin serving the same host as a `ws://`/`wss://` room URL
pub fn http_origin_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}
