use axum::http::HeaderMap;

/// No configured token means every request is authorized. Otherwise
/// accept either a bearer token or the `X-API-Key` header.
pub fn is_authorized(headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return true;
    };

    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(auth) = auth.to_str() {
            if auth == format!("Bearer {token}") {
                return true;
            }
        }
    }

    if let Some(api_key) = headers.get("X-API-Key") {
        if let Ok(api_key) = api_key.to_str() {
            return api_key == token;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn no_token_configured_allows_everything() {
        assert!(is_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn bearer_token_match() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret"),
        );
        assert!(is_authorized(&headers, Some("secret")));
    }

    #[test]
    fn api_key_match() {
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_static("secret"));
        assert!(is_authorized(&headers, Some("secret")));
    }

    #[test]
    fn mismatched_token_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(!is_authorized(&headers, Some("secret")));
    }
}
