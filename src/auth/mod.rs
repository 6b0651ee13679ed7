//! Authentication for outbound requests.
//!
//! Providers obtain credentials (password grant or OAuth2 authorization code)
//! and install an [`AuthTransport`] stage on the client's pipeline. The stage
//! attaches the credential to every request and renews it when the server
//! answers 401. Saved sessions live in a [`SessionStore`].

mod credential;
mod oauth2;
mod password;
mod pkce;
mod provider;
mod storage;
mod transport;

pub use credential::{AuthKind, Credential};
pub use oauth2::{
    adjust_expires_in, AuthorizationCode, CodeObtainer, OAuth2Provider, OAuth2Settings,
    OAuth2Source,
};
pub use password::{PasswordProvider, PasswordSource};
pub use pkce::{random_state, Pkce};
pub use provider::{AuthProvider, CredentialSource};
pub use storage::{Session, SessionStore};
pub use transport::AuthTransport;
