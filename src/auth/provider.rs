//! Contracts shared by the credential strategies.

use std::sync::Arc;

use async_trait::async_trait;

use super::{AuthKind, AuthTransport, Credential};
use crate::{
    error::{Error, Result},
    pipeline::Pipeline,
};

/// Source of fresh credentials for an installed [`AuthTransport`].
///
/// Implementations do their own network I/O on a private client; they must
/// never send through the pipeline they authenticate.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Obtain a replacement for `current`.
    async fn renew(&self, current: &Credential) -> Result<Credential>;
}

/// A credential strategy that can install itself on a client's pipeline.
///
/// Lifecycle: [`attach`](Self::attach) once, then either
/// [`authenticate`](Self::authenticate) for a fresh login or
/// [`set_credential`](Self::set_credential) to resume a saved session.
/// Every other operation returns [`Error::NotAttached`] until `attach` is called.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The kind of transport this provider installs.
    fn kind(&self) -> AuthKind;

    /// Bind the provider to a pipeline and derive its endpoints from the base URL.
    ///
    /// Performs no network I/O.
    fn attach(&mut self, pipeline: Arc<Pipeline>) -> Result<()>;

    /// Perform the initial credential exchange and install the auth stage.
    ///
    /// Any auth stage already installed is replaced in place.
    async fn authenticate(&mut self) -> Result<()>;

    /// The credential of the installed transport, or `None` if none is installed.
    async fn credential(&self) -> Result<Option<Credential>>;

    /// Install or replace the credential, e.g. one restored from disk.
    async fn set_credential(&self, credential: Credential) -> Result<()>;
}

/// Read the credential of an installed transport of `kind`.
pub(crate) async fn installed_credential(
    pipeline: &Pipeline,
    kind: AuthKind,
) -> Result<Option<Credential>> {
    match pipeline.auth().await {
        None => Ok(None),
        Some(transport) if transport.kind() == kind => Ok(Some(transport.credential().await)),
        Some(transport) => Err(Error::TransportMismatch {
            expected: kind,
            found: transport.kind(),
        }),
    }
}

/// Put `credential` into effect on the pipeline.
///
/// An installed transport of another kind is a mismatch. With a source, a new
/// transport replaces the installed one so renewals go through that source.
/// Without one, the installed transport keeps its own source and only the
/// credential is swapped.
pub(crate) async fn restore_credential(
    pipeline: &Pipeline,
    kind: AuthKind,
    credential: Credential,
    source: Option<Arc<dyn CredentialSource>>,
) -> Result<()> {
    if credential.kind() != kind {
        return Err(Error::TransportMismatch {
            expected: kind,
            found: credential.kind(),
        });
    }
    if credential.is_empty() {
        return Err(Error::EmptyCredential);
    }

    match pipeline.auth().await {
        Some(transport) if transport.kind() != kind => Err(Error::TransportMismatch {
            expected: kind,
            found: transport.kind(),
        }),
        Some(transport) if source.is_none() => transport.set_credential(credential).await,
        _ => {
            pipeline
                .install_auth(Arc::new(AuthTransport::new(credential, source)))
                .await;
            Ok(())
        }
    }
}
