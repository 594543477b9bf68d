// Image reference parsing and temp-tag derivation

use serde::{Deserialize, Serialize};

/// A normalized container image reference.
///
/// Exactly one of `tag` / `digest` identifies the version: a reference parsed
/// from `repo@sha256:...` is digest-pinned and never eligible for
/// update-checking, because a digest is a content hash, not a movable pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse `repo[:tag][@digest]`. A bare repository gets the implicit
    /// `latest` tag; a digest-pinned reference keeps its repository but
    /// carries no tag.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        anyhow::ensure!(!raw.is_empty(), "empty image reference");

        let (name, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                anyhow::ensure!(
                    digest.contains(':'),
                    "malformed digest in image reference: {}",
                    raw
                );
                (name, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A colon only counts as a tag separator when it appears after the
        // last path segment; `localhost:5000/app` has no tag.
        let last_segment_start = name.rfind('/').map_or(0, |i| i + 1);
        let tag_split = name[last_segment_start..]
            .rfind(':')
            .map(|i| last_segment_start + i);

        let (repository, tag) = match tag_split {
            Some(i) => (name[..i].to_string(), Some(name[i + 1..].to_string())),
            None => (name.to_string(), None),
        };
        anyhow::ensure!(!repository.is_empty(), "image reference has no repository: {}", raw);

        if digest.is_some() {
            // Digest wins; a `repo:tag@digest` form is pinned, the tag is
            // informational only and dropped during normalization.
            return Ok(Self {
                repository,
                tag: None,
                digest,
            });
        }

        Ok(Self {
            repository,
            tag: Some(tag.unwrap_or_else(|| "latest".to_string())),
            digest: None,
        })
    }

    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// Canonical `repo:tag` or `repo@digest` form used for engine calls.
    pub fn canonical(&self) -> String {
        match (&self.tag, &self.digest) {
            (_, Some(d)) => format!("{}@{}", self.repository, d),
            (Some(t), None) => format!("{}:{}", self.repository, t),
            (None, None) => self.repository.clone(),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Disposable tag under which an unpromoted pulled image is parked while the
/// vulnerability gate inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempTag {
    pub repository: String,
    pub tag: String,
}

impl TempTag {
    /// Deterministic per reference so a crashed run's leftover staging tag is
    /// found (and replaced) by the next run of the same reference.
    pub fn derive(reference: &ImageReference) -> Self {
        let digest = fnv1a64(reference.canonical().as_bytes());
        Self {
            repository: reference.repository.clone(),
            tag: format!("capstan-staging-{:016x}", digest),
        }
    }

    pub fn canonical(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
