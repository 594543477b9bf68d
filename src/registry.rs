// Registry digest checker: compares the remote manifest digest of a tag
// against local repo digests without pulling anything.

use crate::engine::{Engine, EngineError, LocalImageState};
use crate::models::ImageReference;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "result")]
pub enum UpdateCheck {
    UpToDate,
    UpdateAvailable { digest: String },
    /// No repo digests locally: the image was built on this host, never
    /// pulled from a registry, so there is nothing to compare against.
    LocalImage,
    /// Registry unreachable, auth failure, manifest missing. Reported as a
    /// value; the caller treats it as "skip this cycle", never as fatal.
    RegistryError { reason: String },
}

/// Classify whether a newer image exists for `reference`.
///
/// Digest-pinned references are classified without any registry call: a
/// digest is immutable and never eligible for update-checking.
pub async fn check_for_update(
    engine: &dyn Engine,
    reference: &ImageReference,
    local: &LocalImageState,
) -> UpdateCheck {
    if reference.is_pinned() {
        return UpdateCheck::UpToDate;
    }
    if local.repo_digests.is_empty() {
        return UpdateCheck::LocalImage;
    }

    let remote = match engine.remote_manifest_digest(reference).await {
        Ok(d) => d,
        Err(EngineError::NotFound(m)) => {
            return UpdateCheck::RegistryError {
                reason: format!("manifest not found: {}", m),
            };
        }
        Err(e) => {
            return UpdateCheck::RegistryError {
                reason: e.to_string(),
            };
        }
    };

    // RepoDigests entries look like `repo@sha256:...`; any match means the
    // local image is the one the registry currently serves for this tag.
    let already_present = local
        .repo_digests
        .iter()
        .any(|d| d.rsplit('@').next() == Some(remote.as_str()));
    if already_present {
        UpdateCheck::UpToDate
    } else {
        UpdateCheck::UpdateAvailable { digest: remote }
    }
}
