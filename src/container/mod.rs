//! # Container API
//!
//! The narrow container surface the engine depends on. The runner, the cleanup
//! coordinator and the `logs` command only ever talk to [`ContainerApi`]; the
//! [`docker_cli::DockerCli`] implementation drives the `docker` executable.

pub mod docker_cli;

use crate::workflow::PortBinding;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::BTreeMap;

pub use docker_cli::DockerCli;

/// Raw multiplexed log bytes as delivered by the runtime
pub type LogByteStream = BoxStream<'static, Result<Bytes, ContainerError>>;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The container or image does not exist. Cleanup treats this as already cleaned.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("`{command}` failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to launch container runtime: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Unexpected runtime output: {0}")]
    InvalidResponse(String),
}

impl ContainerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateContainerRequest {
    pub image: String,
    pub name: Option<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub labels: BTreeMap<String, String>,
    pub command: Option<Vec<String>>,
}

/// Subset of inspect output the engine relies on
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInspect {
    pub fn has_label(&self, key: &str) -> bool {
        self.labels
            .get(key)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogOptions {
    pub follow: bool,
    pub timestamps: bool,
    /// Only the last N lines
    pub tail: Option<usize>,
}

#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), ContainerError>;

    /// Returns the new container id
    async fn create_container(&self, request: &CreateContainerRequest)
        -> Result<String, ContainerError>;

    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    async fn stop(&self, id: &str) -> Result<(), ContainerError>;

    async fn remove(&self, id: &str) -> Result<(), ContainerError>;

    /// Accepts an id or a name
    async fn inspect(&self, id: &str) -> Result<ContainerInspect, ContainerError>;

    async fn logs(&self, id: &str, options: &LogOptions) -> Result<LogByteStream, ContainerError>;

    /// Containers carrying `label=true`, running or not
    async fn list_managed(&self, label: &str) -> Result<Vec<ContainerSummary>, ContainerError>;
}
