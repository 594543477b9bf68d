// Container-engine boundary. The update pipeline depends only on these
// operations' semantics, not on any particular transport; the production
// implementation (`DockerEngine`) speaks the Docker HTTP API via bollard.

mod docker;

pub use docker::DockerEngine;

use crate::models::{ContainerSnapshot, ImageReference, NetworkAttachment};
use async_trait::async_trait;

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("engine API error: {0}")]
    Api(String),
}

/// Locally-known state of an image name: resolved id plus the registry
/// digests it was pulled under. An empty `repo_digests` means the image was
/// built locally and is not update-checkable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImageState {
    pub id: String,
    pub repo_digests: Vec<String>,
}

/// Creation spec for the self-replacement helper container: a minimal,
/// socket-bound process that finishes the handoff after this process exits.
#[derive(Debug, Clone)]
pub struct HelperSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<String>,
    pub binds: Vec<String>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Liveness check against the engine socket.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Inspect a container and capture a fully-owned snapshot.
    async fn snapshot_container(&self, name: &str) -> Result<ContainerSnapshot, EngineError>;

    /// Resolve an image name to its local id and repo digests.
    async fn local_image_state(&self, reference: &str) -> Result<LocalImageState, EngineError>;

    /// Query the remote registry for the current manifest digest of a tag.
    /// Metadata only; never pulls.
    async fn remote_manifest_digest(&self, reference: &ImageReference)
    -> Result<String, EngineError>;

    /// Pull an image. Overwrites the local tag pointer for the reference.
    async fn pull_image(&self, reference: &ImageReference) -> Result<(), EngineError>;

    /// Point `repository:tag` at an image id.
    async fn tag_image(&self, image_id: &str, repository: &str, tag: &str)
    -> Result<(), EngineError>;

    /// Remove an image reference (untag, delete when last reference).
    async fn remove_image(&self, reference: &str, force: bool) -> Result<(), EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Create a container from a snapshot. The primary network attachment is
    /// applied here when `with_primary_network` is set; secondary attachments
    /// always go through `connect_network` afterwards.
    async fn create_container(
        &self,
        name: &str,
        snapshot: &ContainerSnapshot,
        with_primary_network: bool,
    ) -> Result<String, EngineError>;

    /// Attach a created (not yet started) container to one more network.
    async fn connect_network(
        &self,
        container_id: &str,
        attachment: &NetworkAttachment,
    ) -> Result<(), EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Create and start the self-replacement helper in one step.
    async fn run_helper(&self, spec: &HelperSpec) -> Result<String, EngineError>;
}
