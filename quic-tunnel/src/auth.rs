//! Proxy credentials
//!
//! Clients of the local proxy authenticate with
//! `Proxy-Authorization: Basic base64(user:secret)`. A request that fails the
//! check gets a plain 404, so a probe cannot tell the proxy apart from a web
//! server with nothing to serve.

use base64::Engine;

const NOT_FOUND_BODY: &[u8] = b"404 not found";

/// The one `user:secret` pair the proxy accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    secret: String,
}

#[derive(Debug, thiserror::Error)]
#[error("auth must be exactly `user:secret`")]
pub struct InvalidCredentials;

impl Credentials {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }

    fn matches(&self, user: &str, secret: &str) -> bool {
        self.user == user && self.secret == secret
    }
}

impl std::str::FromStr for Credentials {
    type Err = InvalidCredentials;

    fn from_str(s: &str) -> Result<Self, InvalidCredentials> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(secret), None) => Ok(Credentials::new(user, secret)),
            _ => Err(InvalidCredentials),
        }
    }
}

/// Check and strip the `Proxy-Authorization` header.
///
/// The header is removed whether or not it verifies, so it is never forwarded.
pub fn verify(headers: &mut http::HeaderMap, credentials: &Credentials) -> bool {
    let Some(value) = headers.remove(http::header::PROXY_AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(("Basic", encoded)) = value.split_once(' ') else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    decoded
        .split_once(':')
        .is_some_and(|(user, secret)| credentials.matches(user, secret))
}

/// The response sent for failed authentication.
pub fn not_found() -> http::Response<http_body_util::Full<bytes::Bytes>> {
    let mut response = http::Response::new(http_body_util::Full::new(
        bytes::Bytes::from_static(NOT_FOUND_BODY),
    ));
    *response.status_mut() = http::StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        http::header::CONTENT_LENGTH,
        http::HeaderValue::from(NOT_FOUND_BODY.len()),
    );
    response
}
