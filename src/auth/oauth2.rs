//! OAuth2 authorization-code flow with refresh.
//!
//! The provider builds an authorization URL under `{base}/oauth2/auth` and
//! hands it to a caller-supplied [`CodeObtainer`], which gets the user to
//! approve access however it likes (open a browser, listen on a loopback
//! redirect, ask for a pasted code). The returned code is exchanged at
//! `{base}/oauth2/token` for an access/refresh token pair; later renewals use
//! the refresh token without user interaction.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{header::ACCEPT, Client};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::pkce::{random_state, Pkce};
use super::provider::{installed_credential, restore_credential};
use super::{AuthKind, AuthProvider, AuthTransport, Credential, CredentialSource};
use crate::{
    error::{Error, Result},
    pipeline::Pipeline,
};

/// Authorization endpoint path, relative to the API base URL.
pub const AUTHORIZE_PATH: &str = "/oauth2/auth";

/// Token endpoint path, relative to the API base URL.
pub const TOKEN_PATH: &str = "/oauth2/token";

/// Lifetimes above this many seconds are shortened by [`EXPIRY_MARGIN_SECS`].
const EXPIRY_MARGIN_THRESHOLD_SECS: u64 = 360;

/// Seconds taken off a token's stated lifetime to absorb clock skew.
const EXPIRY_MARGIN_SECS: u64 = 300;

/// Effective lifetime for an `expires_in` reported by the token endpoint.
///
/// Lifetimes over 360 seconds are reported 300 seconds short so the token is
/// treated as stale before the server starts rejecting it. Shorter lifetimes
/// pass through unchanged.
pub fn adjust_expires_in(expires_in: u64) -> u64 {
    if expires_in > EXPIRY_MARGIN_THRESHOLD_SECS {
        expires_in - EXPIRY_MARGIN_SECS
    } else {
        expires_in
    }
}

/// Token endpoint response (RFC 6749 section 5.1).
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    /// Convert to a credential, keeping `previous_refresh` if the server sent none.
    ///
    /// A lifetime too large to represent is treated as no expiry.
    fn into_credential(self, previous_refresh: Option<&str>) -> Credential {
        let expires_at = self
            .expires_in
            .filter(|secs| *secs > 0)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string));

        Credential::oauth2(self.access_token, self.token_type, refresh_token, expires_at)
    }
}

/// The code returned by the user's authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    /// The `state` echoed back on the redirect, if the obtainer captured it.
    pub state: Option<String>,
}

impl AuthorizationCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

impl From<String> for AuthorizationCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl From<&str> for AuthorizationCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// Obtains an authorization code for an authorization URL.
///
/// This is the interactive part of the flow and is supplied by the caller.
#[async_trait]
pub trait CodeObtainer: Send + Sync {
    async fn obtain_code(&self, authorization_url: &str) -> Result<AuthorizationCode>;
}

/// OAuth2 client registration.
#[derive(Clone)]
pub struct OAuth2Settings {
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub redirect_url: String,
}

impl OAuth2Settings {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scopes: Vec<String>,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes,
            redirect_url: redirect_url.into(),
        }
    }
}

impl fmt::Debug for OAuth2Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Settings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("scopes", &self.scopes)
            .field("redirect_url", &self.redirect_url)
            .finish()
    }
}

/// Talks to the OAuth2 endpoints of one API deployment.
#[derive(Debug)]
pub struct OAuth2Source {
    client: Client,
    settings: OAuth2Settings,
    auth_url: String,
    token_url: String,
}

impl OAuth2Source {
    /// Create a source whose endpoints live under `base_url`.
    pub fn new(client: Client, settings: OAuth2Settings, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client,
            settings,
            auth_url: format!("{}{}", base, AUTHORIZE_PATH),
            token_url: format!("{}{}", base, TOKEN_PATH),
        }
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// Build the URL the user visits to grant access.
    ///
    /// Always asks for offline access so that a refresh token is issued.
    pub fn authorization_url(&self, state: &str, pkce: Option<&Pkce>) -> Result<String> {
        let mut url = Url::parse(&self.auth_url)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("access_type", "offline")
                .append_pair("client_id", &self.settings.client_id)
                .append_pair("redirect_uri", &self.settings.redirect_url)
                .append_pair("response_type", "code");
            if !self.settings.scopes.is_empty() {
                query.append_pair("scope", &self.settings.scopes.join(" "));
            }
            query.append_pair("state", state);
            if let Some(pkce) = pkce {
                query
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", Pkce::method());
            }
        }
        Ok(url.into())
    }

    /// Exchange an authorization code for a credential.
    pub async fn exchange(&self, code: &str, pkce: Option<&Pkce>) -> Result<Credential> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.settings.redirect_url.as_str()),
        ];
        if let Some(pkce) = pkce {
            form.push(("code_verifier", pkce.verifier.as_str()));
        }

        let token = self.fetch_token(&form).await?;
        Ok(token.into_credential(None))
    }

    /// Obtain a new access token using the refresh token of `credential`.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        let refresh_token = credential
            .refresh_token()
            .filter(|t| !t.is_empty())
            .ok_or(Error::MissingRefreshToken)?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let token = self.fetch_token(&form).await?;
        Ok(token.into_credential(Some(refresh_token)))
    }

    async fn fetch_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let grant_type = form
            .iter()
            .find(|(key, _)| *key == "grant_type")
            .map(|(_, value)| *value)
            .unwrap_or_default();
        debug!(endpoint = %self.token_url, grant_type, "requesting oauth2 token");

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(endpoint = %self.token_url, status = %status, grant_type, "oauth2 token request rejected");
            return Err(Error::InvalidStatus {
                status,
                url: self.token_url.clone(),
            });
        }

        let from_token_endpoint = response.url().path().ends_with(TOKEN_PATH);
        let body = response.bytes().await?;
        let mut token: TokenResponse = serde_json::from_slice(&body)?;

        if token.access_token.is_empty() {
            return Err(Error::EmptyCredential);
        }
        if from_token_endpoint {
            token.expires_in = token.expires_in.map(adjust_expires_in);
        }

        Ok(token)
    }
}

#[async_trait]
impl CredentialSource for OAuth2Source {
    async fn renew(&self, current: &Credential) -> Result<Credential> {
        self.refresh(current).await
    }
}

struct Attached {
    pipeline: Arc<Pipeline>,
    source: Arc<OAuth2Source>,
}

/// Auth provider for the OAuth2 authorization-code flow.
///
/// # Example
///
/// ```ignore
/// let settings = OAuth2Settings::new(id, secret, vec!["public".into()], "http://localhost:1337");
/// let mut provider = OAuth2Provider::new(settings, Arc::new(LoopbackObtainer));
/// client.authenticate_with_provider(&mut provider).await?;
/// ```
pub struct OAuth2Provider {
    settings: OAuth2Settings,
    obtainer: Arc<dyn CodeObtainer>,
    use_pkce: bool,
    attached: Option<Attached>,
}

impl OAuth2Provider {
    pub fn new(settings: OAuth2Settings, obtainer: Arc<dyn CodeObtainer>) -> Self {
        Self {
            settings,
            obtainer,
            use_pkce: true,
            attached: None,
        }
    }

    /// Enable or disable PKCE (enabled by default).
    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.use_pkce = enabled;
        self
    }

    pub fn settings(&self) -> &OAuth2Settings {
        &self.settings
    }

    /// The authorization URL for `state`, without PKCE.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        self.attached()?.source.authorization_url(state, None)
    }

    /// Exchange a code obtained outside [`authenticate`](AuthProvider::authenticate)
    /// and install the auth stage.
    pub async fn exchange(&self, code: &str) -> Result<()> {
        self.exchange_with(code, None).await
    }

    async fn exchange_with(&self, code: &str, pkce: Option<&Pkce>) -> Result<()> {
        let attached = self.attached()?;
        let credential = attached.source.exchange(code, pkce).await?;

        let source: Arc<dyn CredentialSource> = attached.source.clone();
        attached
            .pipeline
            .install_auth(Arc::new(AuthTransport::new(credential, Some(source))))
            .await;
        Ok(())
    }

    fn attached(&self) -> Result<&Attached> {
        self.attached.as_ref().ok_or(Error::NotAttached)
    }
}

#[async_trait]
impl AuthProvider for OAuth2Provider {
    fn kind(&self) -> AuthKind {
        AuthKind::OAuth2
    }

    fn attach(&mut self, pipeline: Arc<Pipeline>) -> Result<()> {
        let source = OAuth2Source::new(
            pipeline.bootstrap_client(),
            self.settings.clone(),
            pipeline.base_url().as_str(),
        );
        self.attached = Some(Attached {
            pipeline,
            source: Arc::new(source),
        });
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<()> {
        let attached = self.attached()?;

        let pkce = self.use_pkce.then(Pkce::new);
        let state = random_state();
        let url = attached.source.authorization_url(&state, pkce.as_ref())?;

        info!(endpoint = %attached.source.auth_url(), "waiting for oauth2 authorization");
        let code = self.obtainer.obtain_code(&url).await?;

        if code.state.as_deref().is_some_and(|returned| returned != state) {
            warn!("authorization state mismatch");
            return Err(Error::StateMismatch);
        }
        if code.code.is_empty() {
            return Err(Error::Authorization("no authorization code received".to_string()));
        }

        self.exchange_with(&code.code, pkce.as_ref()).await
    }

    async fn credential(&self) -> Result<Option<Credential>> {
        installed_credential(&self.attached()?.pipeline, AuthKind::OAuth2).await
    }

    async fn set_credential(&self, credential: Credential) -> Result<()> {
        let attached = self.attached()?;
        let source: Arc<dyn CredentialSource> = attached.source.clone();
        restore_credential(&attached.pipeline, AuthKind::OAuth2, credential, Some(source)).await
    }
}
