//! Access-token checks for the gateway WebSocket upgrade.
//!
//! Reverse mode accepts a token in an `Authorization: Bearer <token>` or
//! `Authorization: Token <token>` header, or as an `access_token` query
//! parameter. Forward mode presents it as a bearer header.

use std::borrow::Cow;

use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    handshake::{client::Request as ClientRequest, server::Request},
    http::{HeaderValue, header::AUTHORIZATION},
};

use url::form_urlencoded;

use crate::error::TransportError;

/// Whether `request` presents `token`. An empty token admits everyone.
#[must_use]
pub fn is_authorized(request: &Request, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    let from_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("Token "))
        })
        .is_some_and(|presented| presented.trim() == token);
    from_header || query_token(request.uri().query()).as_deref() == Some(token)
}

/// Percent-decoded `access_token` query parameter.
fn query_token(query: Option<&str>) -> Option<Cow<'_, str>> {
    form_urlencoded::parse(query?.as_bytes())
        .find_map(|(key, value)| (key == "access_token").then_some(value))
}

/// Build a client upgrade request for `url`, adding a bearer header when
/// `token` is set.
///
/// # Errors
///
/// Returns [`TransportError`] when `url` is not a valid WebSocket URL or the
/// token cannot be encoded as a header value.
pub fn client_request(url: &str, token: &str) -> Result<ClientRequest, TransportError> {
    let mut request = url.into_client_request()?;
    if !token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio_tungstenite::tungstenite::http;

    use super::*;

    fn request(uri: &str, authorization: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).expect("request")
    }

    #[rstest]
    #[case("/", Some("Bearer secret"), true)]
    #[case("/", Some("Token secret"), true)]
    #[case("/?access_token=secret", None, true)]
    #[case("/?x=1&access_token=secret", None, true)]
    #[case("/", Some("Bearer wrong"), false)]
    #[case("/", Some("secret"), false)]
    #[case("/?access_token=wrong", None, false)]
    #[case("/", None, false)]
    fn token_is_checked(#[case] uri: &str, #[case] header: Option<&str>, #[case] ok: bool) {
        assert_eq!(is_authorized(&request(uri, header), "secret"), ok);
    }

    #[rstest]
    #[case("/?access_token=a%2Bb%26c", true)]
    #[case("/?access_token=a+b%26c", false)]
    #[case("/?access_token=a%2Bb", false)]
    fn query_token_is_percent_decoded(#[case] uri: &str, #[case] ok: bool) {
        assert_eq!(is_authorized(&request(uri, None), "a+b&c"), ok);
    }

    #[test]
    fn empty_token_admits_everyone() {
        assert!(is_authorized(&request("/", None), ""));
    }

    #[test]
    fn client_request_carries_bearer_header() {
        let request = client_request("ws://127.0.0.1:9/", "secret").expect("request");
        assert_eq!(
            request.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer secret")
        );
        let anonymous = client_request("ws://127.0.0.1:9/", "").expect("request");
        assert!(anonymous.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(client_request("not a url", "").is_err());
    }
}
