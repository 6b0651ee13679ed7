//! Outbound request pipeline.
//!
//! A [`Pipeline`] is an ordered list of named stages sitting in front of the
//! HTTP executor. Index 0 is the outermost stage: it sees the request first and
//! the response last. Each stage receives a [`Next`] handle it uses to pass the
//! request further down, possibly more than once.
//!
//! At most one auth stage lives in the list. Installing a new one replaces the
//! old one in place, so stages the caller added beneath it stay beneath it.

use std::{fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use reqwest::{Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::{auth::AuthTransport, error::Result};

/// Role a stage plays in the pipeline. Stages are located and removed by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    /// Attaches credentials and renews them on 401.
    Auth,
    /// Logs requests and responses.
    Trace,
    /// Any caller-defined stage.
    Custom(&'static str),
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::Trace => write!(f, "trace"),
            Self::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// A request-processing stage.
///
/// # Example
///
/// ```ignore
/// struct RequestId;
///
/// #[async_trait]
/// impl Stage for RequestId {
///     fn role(&self) -> StageRole {
///         StageRole::Custom("request-id")
///     }
///
///     async fn handle(&self, mut request: Request, next: Next<'_>) -> Result<Response> {
///         request.headers_mut().insert("x-request-id", HeaderValue::from_static("1"));
///         next.run(request).await
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Send + Sync {
    /// Returns the role of this stage.
    fn role(&self) -> StageRole;

    /// Process a request, delegating to `next` for everything beneath.
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response>;

    /// Short label used by [`Pipeline::describe`].
    fn describe(&self) -> String {
        self.role().to_string()
    }
}

#[derive(Clone)]
enum Slot {
    Auth(Arc<AuthTransport>),
    Stage(Arc<dyn Stage>),
}

impl Slot {
    fn stage(&self) -> &dyn Stage {
        match self {
            Self::Auth(transport) => transport.as_ref(),
            Self::Stage(stage) => stage.as_ref(),
        }
    }
}

/// Handle to the remainder of the pipeline below the current stage.
///
/// `Next` is `Copy`, so a stage may run the rest of the pipeline again
/// (the auth stage does this for its single retry).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    http: &'a reqwest::Client,
    stages: &'a [Slot],
}

impl Next<'_> {
    /// Send the request through the remaining stages and the executor.
    pub async fn run(self, request: Request) -> Result<Response> {
        match self.stages.split_first() {
            Some((slot, rest)) => {
                let next = Next {
                    http: self.http,
                    stages: rest,
                };
                slot.stage().handle(request, next).await
            }
            None => Ok(self.http.execute(request).await?),
        }
    }
}

/// The client's outbound request pipeline.
pub struct Pipeline {
    http: reqwest::Client,
    bootstrap: reqwest::Client,
    base_url: Url,
    stages: RwLock<Arc<Vec<Slot>>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    ///
    /// `http` executes pipeline requests. `bootstrap` is handed to credential
    /// sources so that token requests never pass through the auth stage.
    pub fn new(http: reqwest::Client, bootstrap: reqwest::Client, base_url: Url) -> Self {
        Self {
            http,
            bootstrap,
            base_url,
            stages: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// The executor at the bottom of the pipeline.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// A client for credential requests, isolated from the pipeline stages.
    pub fn bootstrap_client(&self) -> reqwest::Client {
        self.bootstrap.clone()
    }

    /// The API base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build an absolute endpoint URL string for `path` under the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    /// Add a stage as the new outermost stage, wrapping everything installed so far.
    pub async fn add_stage(&self, stage: Arc<dyn Stage>) {
        let mut stages = self.stages.write().await;
        debug!(role = %stage.role(), "adding pipeline stage");
        Arc::make_mut(&mut *stages).insert(0, Slot::Stage(stage));
    }

    /// Remove every non-auth stage with the given role. Returns true if any were removed.
    pub async fn remove_stage(&self, role: StageRole) -> bool {
        let mut stages = self.stages.write().await;
        let before = stages.len();
        Arc::make_mut(&mut *stages)
            .retain(|slot| matches!(slot, Slot::Auth(_)) || slot.stage().role() != role);
        before != stages.len()
    }

    /// Install an auth stage, returning the one it replaced.
    ///
    /// A previous auth stage is swapped out at the same position. With none
    /// installed, the new stage becomes the outermost one.
    pub async fn install_auth(&self, transport: Arc<AuthTransport>) -> Option<Arc<AuthTransport>> {
        let mut guard = self.stages.write().await;
        let stages = Arc::make_mut(&mut *guard);
        let kind = transport.kind();

        let position = stages
            .iter()
            .position(|slot| matches!(slot, Slot::Auth(_)));

        match position {
            Some(index) => {
                let previous = std::mem::replace(&mut stages[index], Slot::Auth(transport));
                info!(kind = %kind, position = index, "replaced auth stage");
                match previous {
                    Slot::Auth(previous) => Some(previous),
                    Slot::Stage(_) => None,
                }
            }
            None => {
                stages.insert(0, Slot::Auth(transport));
                info!(kind = %kind, "installed auth stage");
                None
            }
        }
    }

    /// Remove the auth stage, if any.
    pub async fn remove_auth(&self) -> Option<Arc<AuthTransport>> {
        let mut guard = self.stages.write().await;
        let stages = Arc::make_mut(&mut *guard);
        let index = stages
            .iter()
            .position(|slot| matches!(slot, Slot::Auth(_)))?;
        match stages.remove(index) {
            Slot::Auth(transport) => {
                info!(kind = %transport.kind(), "removed auth stage");
                Some(transport)
            }
            Slot::Stage(_) => None,
        }
    }

    /// The installed auth stage, if any.
    pub async fn auth(&self) -> Option<Arc<AuthTransport>> {
        self.stages.read().await.iter().find_map(|slot| match slot {
            Slot::Auth(transport) => Some(Arc::clone(transport)),
            Slot::Stage(_) => None,
        })
    }

    /// Roles of all installed stages, outermost first.
    pub async fn roles(&self) -> Vec<StageRole> {
        self.stages
            .read()
            .await
            .iter()
            .map(|slot| slot.stage().role())
            .collect()
    }

    /// Human-readable layout, e.g. `trace > auth(token)`.
    pub async fn describe(&self) -> String {
        let stages = self.stages.read().await;
        if stages.is_empty() {
            return "(empty)".to_string();
        }
        stages
            .iter()
            .map(|slot| slot.stage().describe())
            .collect::<Vec<_>>()
            .join(" > ")
    }

    /// Send a request through every stage and then the executor.
    ///
    /// The stage list is snapshotted up front; installing a stage mid-flight
    /// affects only later requests.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let stages = Arc::clone(&*self.stages.read().await);
        let next = Next {
            http: &self.http,
            stages: &stages,
        };
        next.run(request).await
    }
}

/// Stage that logs each request's method, path, status and latency.
///
/// Headers and bodies are never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceStage;

#[async_trait]
impl Stage for TraceStage {
    fn role(&self) -> StageRole {
        StageRole::Trace
    }

    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response> {
        let method = request.method().clone();
        let path = request.url().path().to_string();
        let started = Instant::now();

        let result = next.run(request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => debug!(
                %method,
                %path,
                status = %response.status(),
                elapsed_ms,
                "request completed"
            ),
            Err(err) => debug!(%method, %path, error = %err, elapsed_ms, "request failed"),
        }
        result
    }
}
