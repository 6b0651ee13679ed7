//! Nimbus client - HTTP client SDK for the Nimbus cloud storage API.
//!
//! Requests go through a [`Pipeline`] of stages. Authentication installs
//! itself there as a single auth stage that attaches credentials and renews
//! them transparently when the server rejects them.
//!
//! ```ignore
//! let client = Client::with_base_url("https://app.nimbus.cloud")?;
//! client.authenticate("user@example.com", "secret").await?;
//! let mounts: serde_json::Value = client.request_json(RequestData::get("/api/v2/mounts")).await?;
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;

pub use client::{Client, RequestBody, RequestData};
pub use error::{Error, Result};
pub use pipeline::{Next, Pipeline, Stage, StageRole, TraceStage};
