use url::Url;
use urlencoding::encode;

const ATTR_PREFIX: &str = "URI=\"";

/// True when the upstream response is an HLS playlist
pub fn is_playlist(content_type: &str, url: &str) -> bool {
    content_type.to_ascii_lowercase().contains("mpegurl") || url.ends_with(".m3u8")
}

/// Route every segment and key/map URI of a playlist back through the proxy
pub fn rewrite_playlist(
    content: &str,
    playlist_url: &str,
    user_agent: &str,
    referer: &str,
    proxy_path: &str,
) -> String {
    let base = Url::parse(playlist_url).ok();
    let rewrite = |target: &str| {
        proxy_url(
            proxy_path,
            &resolve(base.as_ref(), target),
            user_agent,
            referer,
        )
    };

    content
        .lines()
        .map(str::trim)
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else if line.starts_with('#') {
                if line.contains(ATTR_PREFIX) {
                    rewrite_uri_attributes(line, &rewrite)
                } else {
                    line.to_string()
                }
            } else {
                rewrite(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn rewrite_uri_attributes(line: &str, rewrite: &impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(line.len() * 2);
    let mut rest = line;
    while let Some(start) = rest.find(ATTR_PREFIX) {
        let value_start = start + ATTR_PREFIX.len();
        let Some(len) = rest[value_start..].find('"') else {
            break;
        };
        out.push_str(&rest[..value_start]);
        out.push_str(&rewrite(&rest[value_start..value_start + len]));
        out.push('"');
        rest = &rest[value_start + len + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve(base: Option<&Url>, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    let Some(base) = base else {
        return target.to_string();
    };
    if target.starts_with('/') {
        return format!("{}{}", base.origin().ascii_serialization(), target);
    }
    base.join(target)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| target.to_string())
}

/// `{proxy_path}?url=..&user_agent=..&referer=..`, empty headers omitted
pub fn proxy_url(proxy_path: &str, target: &str, user_agent: &str, referer: &str) -> String {
    let mut url = format!("{proxy_path}?url={}", encode(target));
    if !user_agent.is_empty() {
        url.push_str(&format!("&user_agent={}", encode(user_agent)));
    }
    if !referer.is_empty() {
        url.push_str(&format!("&referer={}", encode(referer)));
    }
    url
}
