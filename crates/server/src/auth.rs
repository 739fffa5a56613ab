use axum::http::{HeaderMap, HeaderName};
use threadline_storage::UserId;

pub const DEFAULT_USER_HEADER: &str = "x-user-id";

/// Maps an incoming request to the authenticated user, if any.
pub trait UserResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId>;
}

/// Trusts a header set by an upstream auth proxy.
#[derive(Debug, Clone)]
pub struct HeaderUserResolver {
    header: HeaderName,
}

impl HeaderUserResolver {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }

    /// Falls back to [`DEFAULT_USER_HEADER`] when the configured name is not a valid header.
    pub fn from_name(name: &str) -> Self {
        match HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes()) {
            Ok(header) => Self::new(header),
            Err(error) => {
                tracing::warn!(
                    header = name,
                    error = %error,
                    "invalid user header name, using {DEFAULT_USER_HEADER}"
                );
                Self::default()
            }
        }
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

impl Default for HeaderUserResolver {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_USER_HEADER))
    }
}

impl UserResolver for HeaderUserResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        let raw = headers.get(&self.header)?.to_str().ok()?;
        UserId::parse(raw).ok()
    }
}
