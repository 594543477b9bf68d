// Safe-pull tag guard: the production tag never points at an unverified
// image except for the instant between pull completion and tag restoration.

use crate::engine::Engine;
use crate::models::{ImageReference, TempTag};
use crate::scanner::GateDecision;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-image-reference async locks. The pull/restore sequence must execute
/// back-to-back without another operation's pull interleaving on the same
/// tag, so every guard run holds the lock for its reference end to end.
#[derive(Default)]
pub struct TagLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TagLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafePullOutcome {
    /// Gate passed; the production tag now points at the new image.
    Promoted { new_image_id: String },
    /// The pull produced the image already running; nothing changed.
    Unchanged,
    /// Gate blocked; temp image discarded, production tag untouched.
    Blocked { reason: String },
}

/// Pull a new image for `reference` without ever leaving the production tag
/// pointing at an unverified image.
///
/// The tag is restored to `known_good_id` immediately after the pull, the
/// new image is parked under a deterministic temp tag, and only a passing
/// gate decision promotes it. On a blocked or failed run the production tag
/// still resolves to `known_good_id` and the temp image is removed.
///
/// Digest-pinned references cannot be re-tagged and must not reach this
/// function; callers route them to `plain_pull` (scanning disabled) or skip.
pub async fn safe_pull<F, Fut>(
    engine: &dyn Engine,
    locks: &TagLocks,
    reference: &ImageReference,
    known_good_id: &str,
    gate: F,
) -> anyhow::Result<SafePullOutcome>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = anyhow::Result<GateDecision>>,
{
    anyhow::ensure!(
        !reference.is_pinned(),
        "digest-pinned reference {} cannot go through the tag guard",
        reference
    );
    let tag = reference
        .tag
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("reference {} has no tag", reference))?;

    let _guard = locks.acquire(&reference.canonical()).await;

    engine
        .pull_image(reference)
        .await
        .map_err(|e| anyhow::anyhow!("pull of {} failed: {}", reference, e))?;

    let new_image_id = engine
        .local_image_state(&reference.canonical())
        .await
        .map_err(|e| anyhow::anyhow!("inspect after pull of {} failed: {}", reference, e))?
        .id;

    if new_image_id == known_good_id {
        return Ok(SafePullOutcome::Unchanged);
    }

    // Safety boundary: from here on, anything reading the production tag
    // sees the old, verified image again.
    engine
        .tag_image(known_good_id, &reference.repository, tag)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "restoring production tag {} to known-good image failed: {}",
                reference,
                e
            )
        })?;

    let temp = TempTag::derive(reference);
    engine
        .tag_image(&new_image_id, &temp.repository, &temp.tag)
        .await
        .map_err(|e| anyhow::anyhow!("staging tag {} failed: {}", temp.canonical(), e))?;

    let decision = match gate(new_image_id.clone()).await {
        Ok(d) => d,
        Err(e) => {
            discard_temp(engine, &temp).await;
            return Err(e.context(format!("gate evaluation for {} failed", reference)));
        }
    };

    match decision {
        GateDecision::Blocked { reason } => {
            discard_temp(engine, &temp).await;
            Ok(SafePullOutcome::Blocked { reason })
        }
        GateDecision::Allowed => {
            if let Err(e) = engine
                .tag_image(&new_image_id, &reference.repository, tag)
                .await
            {
                discard_temp(engine, &temp).await;
                return Err(anyhow::anyhow!(
                    "promoting {} to production tag failed: {}",
                    reference,
                    e
                ));
            }
            // Best effort: the image is promoted either way.
            if let Err(e) = engine.remove_image(&temp.canonical(), false).await {
                tracing::warn!(
                    temp_tag = %temp.canonical(),
                    error = %e,
                    "failed to clean up staging tag after promotion"
                );
            }
            Ok(SafePullOutcome::Promoted { new_image_id })
        }
    }
}

/// Plain pull with no tag guard. Only valid when vulnerability scanning is
/// disabled; the production tag points at the new image as soon as the pull
/// completes.
pub async fn plain_pull(
    engine: &dyn Engine,
    locks: &TagLocks,
    reference: &ImageReference,
) -> anyhow::Result<String> {
    let _guard = locks.acquire(&reference.canonical()).await;
    engine
        .pull_image(reference)
        .await
        .map_err(|e| anyhow::anyhow!("pull of {} failed: {}", reference, e))?;
    let state = engine
        .local_image_state(&reference.canonical())
        .await
        .map_err(|e| anyhow::anyhow!("inspect after pull of {} failed: {}", reference, e))?;
    Ok(state.id)
}

async fn discard_temp(engine: &dyn Engine, temp: &TempTag) {
    if let Err(e) = engine.remove_image(&temp.canonical(), true).await {
        tracing::warn!(
            temp_tag = %temp.canonical(),
            error = %e,
            "failed to discard temp-tagged image"
        );
    }
}
