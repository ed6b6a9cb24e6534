//! Public URL computation
//!
//! Clients behind a reverse proxy must be told the address they used, not the
//! one we bound to. Precedence: configured base URL, the standard `Forwarded`
//! header, `X-Forwarded-Host` / `X-Forwarded-Proto`, then `Host`.

use axum::http::HeaderMap;

/// Normalize a base path to either `""` or `/segment[/segment...]`
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Join a scheme+host with a base path, without a trailing slash
pub fn format_base_url(base_host: &str, base_path: &str) -> String {
    format!("{}{}", base_host.trim_end_matches('/'), normalize_base_path(base_path))
}

/// Scheme and host the client used to reach us
pub fn server_url_host(headers: &HeaderMap, url_base: Option<&str>) -> String {
    if let Some(configured) = url_base.filter(|u| !u.is_empty()) {
        return configured.trim_end_matches('/').to_string();
    }

    if let Some((proto, host)) = forwarded(headers) {
        return format!("{}://{}", proto, host);
    }

    let mut scheme = "http".to_string();
    let mut host = header(headers, "host")
        .map(|h| h.trim_end_matches('/').to_string())
        .unwrap_or_else(|| "localhost".to_string());

    if let Some(forwarded_host) = header(headers, "x-forwarded-host") {
        host = forwarded_host.to_string();
    }
    if let Some(forwarded_proto) = header(headers, "x-forwarded-proto") {
        scheme = forwarded_proto.to_string();
    }

    format!("{}://{}", scheme, host)
}

/// Base URL for websocket connections, e.g. `wss://example.com/events`
pub fn server_ws_base(headers: &HeaderMap, url_base: Option<&str>, base_path: &str) -> String {
    let http = format_base_url(&server_url_host(headers, url_base), base_path);
    if let Some(rest) = http.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = http.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        http
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `host` and `proto` from the first element of an RFC 7239 `Forwarded` header
fn forwarded(headers: &HeaderMap) -> Option<(String, String)> {
    let value = header(headers, "forwarded")?;
    let first = value.split(',').next()?;

    let mut host = None;
    let mut proto = None;
    for pair in first.split(';') {
        let Some((key, val)) = pair.split_once('=') else {
            continue;
        };
        let val = val.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "host" => host = Some(val),
            "proto" => proto = Some(val),
            _ => {}
        }
    }
    Some((proto?, host?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("events"), "/events");
        assert_eq!(normalize_base_path("/events/v1/"), "/events/v1");
    }

    #[test]
    fn test_host_header() {
        let h = headers(&[("host", "example.com:7700")]);
        assert_eq!(server_url_host(&h, None), "http://example.com:7700");
    }

    #[test]
    fn test_configured_url_wins() {
        let h = headers(&[("host", "internal:7700"), ("x-forwarded-host", "proxy")]);
        assert_eq!(server_url_host(&h, Some("https://public.example/")), "https://public.example");
    }

    #[test]
    fn test_forwarded_header() {
        let h = headers(&[
            ("host", "internal:7700"),
            ("forwarded", "for=192.0.2.60;proto=https;host=\"events.example\", for=10.0.0.1"),
        ]);
        assert_eq!(server_url_host(&h, None), "https://events.example");
    }

    #[test]
    fn test_forwarded_without_proto_falls_through() {
        let h = headers(&[
            ("host", "internal:7700"),
            ("forwarded", "host=events.example"),
            ("x-forwarded-proto", "https"),
        ]);
        assert_eq!(server_url_host(&h, None), "https://internal:7700");
    }

    #[test]
    fn test_x_forwarded_headers() {
        let h = headers(&[
            ("host", "internal:7700"),
            ("x-forwarded-host", "events.example"),
            ("x-forwarded-proto", "https"),
        ]);
        assert_eq!(server_url_host(&h, None), "https://events.example");
    }

    #[test]
    fn test_ws_base() {
        let plain = headers(&[("host", "localhost:7700")]);
        assert_eq!(server_ws_base(&plain, None, "/"), "ws://localhost:7700");
        assert_eq!(server_ws_base(&plain, None, "/events/"), "ws://localhost:7700/events");

        let secure = headers(&[("host", "internal"), ("x-forwarded-proto", "https")]);
        assert_eq!(server_ws_base(&secure, None, "/"), "wss://internal");
    }
}
