//! Nimbus API client.
//!
//! [`Client`] owns the request [`Pipeline`] and issues requests described by
//! [`RequestData`]. Authentication is delegated to an [`AuthProvider`], which
//! installs its stage on the pipeline.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT},
    Method, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    auth::{AuthKind, AuthProvider, AuthTransport, Credential, PasswordProvider},
    config::ApiConfig,
    error::{Error, Result},
    pipeline::{Pipeline, Stage},
};

/// Body of an API request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Bytes(Bytes),
}

/// Description of one API request.
///
/// # Example
///
/// ```ignore
/// let request = RequestData::get("/api/v2/mounts/primary/files/info")
///     .param("path", "/docs")
///     .expect(StatusCode::OK);
/// let info: FileInfo = client.request_json(request).await?;
/// ```
#[derive(Debug, Clone)]
pub struct RequestData {
    pub method: Method,
    /// Path relative to the API base URL, starting with `/`.
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Accepted statuses; any 2xx if empty.
    pub expected_status: Vec<StatusCode>,
}

impl RequestData {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            expected_status: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Some(RequestBody::Json(serde_json::to_value(value)?));
        Ok(self)
    }

    /// Set a raw body.
    pub fn bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Bytes(body.into()));
        self
    }

    /// Accept `status` as a successful response.
    pub fn expect(mut self, status: StatusCode) -> Self {
        self.expected_status.push(status);
        self
    }

    fn accepts(&self, status: StatusCode) -> bool {
        if self.expected_status.is_empty() {
            status.is_success()
        } else {
            self.expected_status.contains(&status)
        }
    }
}

/// Client for the Nimbus API.
pub struct Client {
    pipeline: Arc<Pipeline>,
    user_agent: String,
}

impl Client {
    /// Create a client from connection settings.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        let http = build_http(config)?;
        let bootstrap = build_http(config)?;

        Ok(Self {
            pipeline: Arc::new(Pipeline::new(http, bootstrap, base_url)),
            user_agent: config.user_agent.clone(),
        })
    }

    /// Create a client for `base_url` with default settings.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::new(&ApiConfig {
            base_url: base_url.into(),
            ..ApiConfig::default()
        })
    }

    pub fn base_url(&self) -> &Url {
        self.pipeline.base_url()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
        self.user_agent = user_agent.into();
    }

    /// Add a stage outside everything installed so far.
    pub async fn add_stage(&self, stage: Arc<dyn Stage>) {
        self.pipeline.add_stage(stage).await;
    }

    /// Log in with email and password.
    pub async fn authenticate(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<()> {
        let mut provider = PasswordProvider::new(email, password);
        self.authenticate_with_provider(&mut provider).await
    }

    /// Attach `provider` to this client and run its initial exchange.
    pub async fn authenticate_with_provider(&self, provider: &mut dyn AuthProvider) -> Result<()> {
        self.attach_provider(provider)?;
        provider.authenticate().await?;
        debug!(kind = %provider.kind(), "authenticated");
        Ok(())
    }

    /// Attach `provider` without authenticating, e.g. before restoring a saved credential.
    pub fn attach_provider(&self, provider: &mut dyn AuthProvider) -> Result<()> {
        provider.attach(Arc::clone(&self.pipeline))
    }

    /// The credential currently attached to requests, if any.
    pub async fn credential(&self) -> Option<Credential> {
        match self.pipeline.auth().await {
            Some(transport) => Some(transport.credential().await),
            None => None,
        }
    }

    /// The current token value, if any.
    pub async fn token(&self) -> Option<String> {
        self.credential()
            .await
            .map(|credential| credential.access_token().to_string())
    }

    /// Use a static token.
    ///
    /// Replaces the credential of an installed token transport, keeping its
    /// ability to renew. With no auth stage installed, installs one that
    /// cannot renew. Fails with [`Error::TransportMismatch`] if an OAuth2
    /// transport is installed.
    pub async fn set_token(&self, token: impl Into<String>) -> Result<()> {
        let credential = Credential::token(token);
        if credential.is_empty() {
            return Err(Error::EmptyCredential);
        }

        match self.pipeline.auth().await {
            Some(transport) if transport.kind() == AuthKind::Token => {
                transport.set_credential(credential).await
            }
            Some(transport) => Err(Error::TransportMismatch {
                expected: AuthKind::Token,
                found: transport.kind(),
            }),
            None => {
                self.pipeline
                    .install_auth(Arc::new(AuthTransport::new(credential, None)))
                    .await;
                Ok(())
            }
        }
    }

    /// Issue a request and check its status.
    pub async fn execute(&self, request: RequestData) -> Result<Response> {
        let mut url = Url::parse(&self.pipeline.endpoint(&request.path))?;
        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.params);
        }

        let mut builder = self
            .pipeline
            .http()
            .request(request.method.clone(), url)
            .headers(request.headers.clone())
            .header(USER_AGENT, self.user_agent.as_str());
        builder = match &request.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes.clone()),
            None => builder,
        };

        let response = self.pipeline.send(builder.build()?).await?;
        let status = response.status();
        debug!(method = %request.method, path = %request.path, status = %status, "received API response");

        if !request.accepts(status) {
            return Err(Error::InvalidStatus {
                status,
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }

    /// Issue a request and decode a JSON response body.
    pub async fn request_json<T: DeserializeOwned>(&self, request: RequestData) -> Result<T> {
        let response = self.execute(request).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Issue a request and collect the raw response body.
    pub async fn request_bytes(&self, request: RequestData) -> Result<Bytes> {
        let response = self.execute(request).await?;
        Ok(response.bytes().await?)
    }

    /// Issue a request and stream the raw response body.
    pub async fn request_stream(
        &self,
        request: RequestData,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let response = self.execute(request).await?;
        Ok(response.bytes_stream().map_err(Error::from).boxed())
    }
}

fn build_http(config: &ApiConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .danger_accept_invalid_certs(config.accept_invalid_certs);
    if config.timeout_secs > 0 {
        builder = builder.timeout(Duration::from_secs(config.timeout_secs));
    }
    Ok(builder.build()?)
}
