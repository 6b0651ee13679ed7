//! Error types shared by the client, the request pipeline and auth providers.

use reqwest::StatusCode;
use thiserror::Error;

use crate::auth::AuthKind;

/// Result type for client operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while authenticating or issuing requests.
#[derive(Debug, Error)]
pub enum Error {
    /// An auth provider was used before being attached to a client.
    #[error("auth provider is not attached to a client")]
    NotAttached,

    /// An endpoint answered with a status the caller did not expect.
    #[error("invalid status {status} received from {url}")]
    InvalidStatus { status: StatusCode, url: String },

    /// The installed auth transport is not the kind the operation needs.
    #[error("installed transport is {found}, expected {expected}")]
    TransportMismatch { expected: AuthKind, found: AuthKind },

    /// An OAuth2 credential has no refresh token to renew with.
    #[error("credential has no refresh token")]
    MissingRefreshToken,

    /// The credential endpoint returned an empty token.
    #[error("credential endpoint returned an empty token")]
    EmptyCredential,

    /// The authorization response carried a state we did not issue.
    #[error("authorization state mismatch")]
    StateMismatch,

    /// The authorization code could not be obtained from the user.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// The installed transport has no credential source to renew from.
    #[error("credential cannot be renewed without a credential source")]
    RenewalUnavailable,

    #[error("credential is not a valid header value")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::InvalidStatus { status, .. } => Some(*status),
            Self::Http(err) => err.status(),
            _ => None,
        }
    }

    /// Returns true if this error is a 401 from the server.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}
