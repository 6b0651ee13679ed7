//! Credentials attached to outbound requests.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds before the stated expiry at which an OAuth2 token counts as expired.
const EXPIRY_DELTA_SECS: i64 = 10;

/// Authentication scheme of a credential or an installed auth transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// `Authorization: Token token=<value>`, from a static token or the password flow.
    Token,
    /// `Authorization: Bearer <value>`, from the OAuth2 authorization-code flow.
    OAuth2,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token => write!(f, "token"),
            Self::OAuth2 => write!(f, "oauth2"),
        }
    }
}

/// A bearer credential, either a plain API token or an OAuth2 token set.
///
/// Renewal replaces a credential wholesale; fields are never merged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credential {
    /// Token issued by the password endpoint or supplied directly.
    #[serde(rename = "token")]
    Token {
        /// The token value.
        token: String,
    },

    /// OAuth2 access token with optional refresh capability.
    #[serde(rename = "oauth2")]
    OAuth2 {
        /// The access token for API calls.
        access_token: String,
        /// Token type reported by the server (usually "bearer").
        token_type: String,
        /// Refresh token for obtaining new access tokens.
        refresh_token: Option<String>,
        /// When the access token expires, already adjusted for clock skew.
        expires_at: Option<DateTime<Utc>>,
    },
}

impl Credential {
    /// Create a static token credential.
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }

    /// Create an OAuth2 credential.
    pub fn oauth2(
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::OAuth2 {
            access_token: access_token.into(),
            token_type: token_type.into(),
            refresh_token,
            expires_at,
        }
    }

    pub fn kind(&self) -> AuthKind {
        match self {
            Self::Token { .. } => AuthKind::Token,
            Self::OAuth2 { .. } => AuthKind::OAuth2,
        }
    }

    /// The value sent to the server.
    pub fn access_token(&self) -> &str {
        match self {
            Self::Token { token } => token,
            Self::OAuth2 { access_token, .. } => access_token,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Self::Token { .. } => None,
            Self::OAuth2 { refresh_token, .. } => refresh_token.as_deref(),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Token { .. } => None,
            Self::OAuth2 { expires_at, .. } => *expires_at,
        }
    }

    /// Check if this credential is expired.
    ///
    /// Static tokens and OAuth2 tokens without expiry never expire.
    pub fn is_expired(&self) -> bool {
        self.expires_at()
            .map(|exp| exp - Duration::seconds(EXPIRY_DELTA_SECS) < Utc::now())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.access_token().is_empty()
    }

    /// The `Authorization` header value for this credential.
    pub fn authorization(&self) -> String {
        match self {
            Self::Token { token } => format!("Token token={}", token),
            Self::OAuth2 {
                access_token,
                token_type,
                ..
            } => format!("{} {}", scheme(token_type), access_token),
        }
    }

    pub(crate) fn header_value(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&self.authorization()).map_err(Error::from)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Canonical casing for well-known OAuth2 token types.
fn scheme(token_type: &str) -> &str {
    if token_type.is_empty() || token_type.eq_ignore_ascii_case("bearer") {
        "Bearer"
    } else if token_type.eq_ignore_ascii_case("mac") {
        "MAC"
    } else if token_type.eq_ignore_ascii_case("basic") {
        "Basic"
    } else {
        token_type
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token { .. } => f.debug_struct("Token").field("token", &"[redacted]").finish(),
            Self::OAuth2 {
                token_type,
                refresh_token,
                expires_at,
                ..
            } => f
                .debug_struct("OAuth2")
                .field("access_token", &"[redacted]")
                .field("token_type", token_type)
                .field("refresh_token", &refresh_token.as_ref().map(|_| "[redacted]"))
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_credential() {
        let cred = Credential::token("abc");
        assert_eq!(cred.kind(), AuthKind::Token);
        assert_eq!(cred.access_token(), "abc");
        assert_eq!(cred.authorization(), "Token token=abc");
        assert!(cred.refresh_token().is_none());
        assert!(!cred.is_expired());
    }

    #[test]
    fn test_oauth2_authorization_scheme() {
        let cred = Credential::oauth2("access", "bearer", None, None);
        assert_eq!(cred.authorization(), "Bearer access");

        let cred = Credential::oauth2("access", "", None, None);
        assert_eq!(cred.authorization(), "Bearer access");

        let cred = Credential::oauth2("access", "mac", None, None);
        assert_eq!(cred.authorization(), "MAC access");
    }

    #[test]
    fn test_oauth2_expiry() {
        let past = Utc::now() - Duration::minutes(1);
        let cred = Credential::oauth2("a", "bearer", Some("r".to_string()), Some(past));
        assert!(cred.is_expired());

        let almost = Utc::now() + Duration::seconds(5);
        let cred = Credential::oauth2("a", "bearer", None, Some(almost));
        assert!(cred.is_expired());

        let future = Utc::now() + Duration::hours(1);
        let cred = Credential::oauth2("a", "bearer", None, Some(future));
        assert!(!cred.is_expired());

        let cred = Credential::oauth2("a", "bearer", None, None);
        assert!(!cred.is_expired());
    }

    #[test]
    fn test_header_value_is_sensitive() {
        let value = Credential::token("abc").header_value().unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().unwrap(), "Token token=abc");
    }

    #[test]
    fn test_header_value_rejects_control_characters() {
        let result = Credential::token("abc\n").header_value();
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cred = Credential::oauth2("secret-access", "bearer", Some("secret-refresh".into()), None);
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(debug.contains("[redacted]"));
    }

    #[test]
    fn test_credential_serialization() {
        let json = serde_json::to_string(&Credential::token("abc")).unwrap();
        assert!(json.contains("\"type\":\"token\""));
        assert!(json.contains("\"token\":\"abc\""));

        let cred = Credential::oauth2("access", "bearer", Some("refresh".into()), None);
        let json = serde_json::to_string(&cred).unwrap();
        assert!(json.contains("\"type\":\"oauth2\""));
        assert!(json.contains("\"refresh_token\":\"refresh\""));
    }
}
