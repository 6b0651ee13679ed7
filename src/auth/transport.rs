//! Pipeline stage that attaches credentials and renews them on 401.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Method, Request, Response, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{AuthKind, Credential, CredentialSource};
use crate::{
    error::{Error, Result},
    pipeline::{Next, Stage, StageRole},
};

/// Auth stage of a [`Pipeline`](crate::pipeline::Pipeline).
///
/// Every request gets the current credential in its `Authorization` header.
/// When the server answers 401 the credential is renewed from the source and
/// GET/HEAD requests are retried exactly once with the new credential. Other
/// methods, and a second 401, are handed back to the caller unchanged.
///
/// The credential lock is held only to read or replace the value, never
/// across a network call. Two concurrent renewals both succeed and the later
/// one wins.
pub struct AuthTransport {
    kind: AuthKind,
    source: Option<Arc<dyn CredentialSource>>,
    credential: RwLock<Credential>,
}

impl AuthTransport {
    /// Create a transport holding `credential`.
    ///
    /// Without a source, a 401 cannot be recovered from and is surfaced as is.
    pub fn new(credential: Credential, source: Option<Arc<dyn CredentialSource>>) -> Self {
        Self {
            kind: credential.kind(),
            source,
            credential: RwLock::new(credential),
        }
    }

    pub fn kind(&self) -> AuthKind {
        self.kind
    }

    /// Whether this transport can renew its credential.
    pub fn can_renew(&self) -> bool {
        self.source.is_some()
    }

    /// The credential currently attached to requests.
    pub async fn credential(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// Replace the credential used for following requests.
    pub async fn set_credential(&self, credential: Credential) -> Result<()> {
        if credential.kind() != self.kind {
            return Err(Error::TransportMismatch {
                expected: self.kind,
                found: credential.kind(),
            });
        }
        *self.credential.write().await = credential;
        Ok(())
    }

    /// Obtain a fresh credential from the source and store it.
    async fn renew(&self, stale: &Credential) -> Result<Credential> {
        let source = self.source.as_ref().ok_or(Error::RenewalUnavailable)?;
        debug!(kind = %self.kind, "renewing credential");

        let renewed = source.renew(stale).await?;
        if renewed.is_empty() {
            return Err(Error::EmptyCredential);
        }

        *self.credential.write().await = renewed.clone();
        Ok(renewed)
    }
}

fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

fn attach(request: &mut Request, credential: &Credential) -> Result<()> {
    request
        .headers_mut()
        .insert(AUTHORIZATION, credential.header_value()?);
    Ok(())
}

#[async_trait]
impl Stage for AuthTransport {
    fn role(&self) -> StageRole {
        StageRole::Auth
    }

    fn describe(&self) -> String {
        format!("auth({})", self.kind)
    }

    async fn handle(&self, mut request: Request, next: Next<'_>) -> Result<Response> {
        let mut credential = self.credential().await;
        if credential.is_expired() && self.can_renew() {
            debug!(kind = %self.kind, "credential expired, renewing before send");
            credential = self.renew(&credential).await?;
        }

        let retry = if is_idempotent(request.method()) {
            request.try_clone()
        } else {
            None
        };

        attach(&mut request, &credential)?;
        let response = next.run(request).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let renewed = match self.renew(&credential).await {
            Ok(renewed) => renewed,
            Err(err) => {
                warn!(kind = %self.kind, error = %err, "credential renewal failed");
                return Ok(response);
            }
        };

        let Some(mut retry) = retry else {
            debug!(kind = %self.kind, "not retrying non-idempotent request after 401");
            return Ok(response);
        };

        debug!(kind = %self.kind, method = %retry.method(), "retrying request with renewed credential");
        attach(&mut retry, &renewed)?;
        next.run(retry).await
    }
}
