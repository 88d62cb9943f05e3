//! Credentials consumed by the signer.

use std::fmt;

/// Source of signing credentials.
///
/// Values are fetched per request so implementations may rotate them.
pub trait Credentials: Send + Sync {
    /// Application id; an empty id means anonymous and disables signing.
    fn app_id(&self) -> String;

    /// Application secret used as the HMAC key.
    fn app_secret(&self) -> String;

    /// Temporary security token, sent as `X-Security-Token`.
    fn security_token(&self) -> Option<String> {
        None
    }
}

/// Fixed credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StaticCredentials {
    app_id: String,
    app_secret: String,
    security_token: Option<String>,
}

impl StaticCredentials {
    /// Credentials without a security token.
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            security_token: None,
        }
    }

    /// Anonymous credentials; requests are sent unsigned.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Attaches a security token; an empty token is ignored.
    #[must_use]
    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.security_token = (!token.is_empty()).then_some(token);
        self
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field(
                "security_token",
                &self.security_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Credentials for StaticCredentials {
    fn app_id(&self) -> String {
        self.app_id.clone()
    }

    fn app_secret(&self) -> String {
        self.app_secret.clone()
    }

    fn security_token(&self) -> Option<String> {
        self.security_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = StaticCredentials::new("app", "top-secret").with_security_token("tok-123");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("app"));
        assert!(!rendered.contains("top-secret"));
        assert!(!rendered.contains("tok-123"));
    }

    #[test]
    fn test_empty_token_is_dropped() {
        let creds = StaticCredentials::new("app", "s").with_security_token("");
        assert_eq!(creds.security_token(), None);
    }

    #[test]
    fn test_anonymous_has_empty_app_id() {
        assert!(StaticCredentials::anonymous().app_id().is_empty());
    }
}
