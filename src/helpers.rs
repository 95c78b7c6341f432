/// Join a base URL and a path, tolerating a trailing slash on the base and a
/// missing leading slash on the path.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Derive the push channel URL from an HTTP base URL (`http://h/api` →
/// `ws://h/ws`, `https://h/api` → `wss://h/ws`).
pub fn ws_url_from_http(base: &str) -> Option<String> {
    let (scheme, rest) = if let Some(rest) = base.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return None;
    };
    let host = rest.split('/').next().filter(|h| !h.is_empty())?;
    Some(format!("{scheme}://{host}/ws"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h/api/", "/orders"), "http://h/api/orders");
        assert_eq!(join_url("http://h/api", "orders"), "http://h/api/orders");
    }

    #[test]
    fn test_ws_url_from_http() {
        assert_eq!(
            ws_url_from_http("https://shop.example.com/api").as_deref(),
            Some("wss://shop.example.com/ws")
        );
        assert_eq!(
            ws_url_from_http("http://localhost:5000/api").as_deref(),
            Some("ws://localhost:5000/ws")
        );
        assert!(ws_url_from_http("ftp://x").is_none());
    }
}
