//! Password-grant authentication.
//!
//! The user's email and password are exchanged at `POST {base}/token` for an
//! API token, sent as `Authorization: Token token=<value>`. The same exchange
//! is repeated whenever the server rejects the token.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::provider::{installed_credential, restore_credential};
use super::{AuthKind, AuthProvider, AuthTransport, Credential, CredentialSource};
use crate::{
    error::{Error, Result},
    pipeline::Pipeline,
};

/// Path of the password token endpoint, relative to the API base URL.
pub const TOKEN_PATH: &str = "/token";

/// Token exchange request.
#[derive(Serialize)]
struct TokenRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Token exchange response. The server spells the field `Token`.
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "Token")]
    token: String,
}

/// Exchanges an email and password for an API token.
pub struct PasswordSource {
    client: Client,
    endpoint: String,
    email: String,
    password: String,
}

impl PasswordSource {
    /// Create a source posting to `endpoint` with its own HTTP client.
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Request a new token.
    ///
    /// Any status other than 200 is [`Error::InvalidStatus`]; there is no retry here.
    pub async fn obtain(&self) -> Result<Credential> {
        debug!(endpoint = %self.endpoint, "requesting token");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TokenRequest {
                email: &self.email,
                password: &self.password,
            })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(endpoint = %self.endpoint, status = %status, "token request rejected");
            return Err(Error::InvalidStatus {
                status,
                url: self.endpoint.clone(),
            });
        }

        let body = response.bytes().await?;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        if token.token.is_empty() {
            return Err(Error::EmptyCredential);
        }

        Ok(Credential::token(token.token))
    }
}

#[async_trait]
impl CredentialSource for PasswordSource {
    async fn renew(&self, _current: &Credential) -> Result<Credential> {
        self.obtain().await
    }
}

impl fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordSource")
            .field("endpoint", &self.endpoint)
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .finish()
    }
}

struct Attached {
    pipeline: Arc<Pipeline>,
    source: Arc<PasswordSource>,
}

/// Auth provider for the email/password flow.
///
/// # Example
///
/// ```ignore
/// let mut provider = PasswordProvider::new("user@example.com", "secret");
/// client.authenticate_with_provider(&mut provider).await?;
/// ```
pub struct PasswordProvider {
    email: String,
    password: String,
    token_endpoint: Option<String>,
    attached: Option<Attached>,
}

impl PasswordProvider {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            token_endpoint: None,
            attached: None,
        }
    }

    /// Use a token endpoint other than `{base}/token`.
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    /// The token endpoint, once attached.
    pub fn token_endpoint(&self) -> Result<&str> {
        Ok(self.attached()?.source.endpoint())
    }

    fn attached(&self) -> Result<&Attached> {
        self.attached.as_ref().ok_or(Error::NotAttached)
    }
}

#[async_trait]
impl AuthProvider for PasswordProvider {
    fn kind(&self) -> AuthKind {
        AuthKind::Token
    }

    fn attach(&mut self, pipeline: Arc<Pipeline>) -> Result<()> {
        let endpoint = self
            .token_endpoint
            .clone()
            .unwrap_or_else(|| pipeline.endpoint(TOKEN_PATH));
        let source = PasswordSource::new(
            pipeline.bootstrap_client(),
            endpoint,
            self.email.as_str(),
            self.password.as_str(),
        );
        self.attached = Some(Attached {
            pipeline,
            source: Arc::new(source),
        });
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<()> {
        let attached = self.attached()?;
        let credential = attached.source.obtain().await?;

        let source: Arc<dyn CredentialSource> = attached.source.clone();
        attached
            .pipeline
            .install_auth(Arc::new(AuthTransport::new(credential, Some(source))))
            .await;
        Ok(())
    }

    async fn credential(&self) -> Result<Option<Credential>> {
        installed_credential(&self.attached()?.pipeline, AuthKind::Token).await
    }

    async fn set_credential(&self, credential: Credential) -> Result<()> {
        let attached = self.attached()?;
        let source: Arc<dyn CredentialSource> = attached.source.clone();
        restore_credential(&attached.pipeline, AuthKind::Token, credential, Some(source)).await
    }
}
