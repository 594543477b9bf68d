// Vulnerability scanner collaborator and the pure allow/block gate.

use crate::models::ImageReference;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Vulnerability counts by severity tier, as reported by the external
/// scanner. Treated as an opaque comparable value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub unknown: u32,
    pub scanner: String,
    pub finished_at: i64,
}

impl ScanSummary {
    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low + self.unknown
    }

    pub fn count_at_or_above(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.critical + self.high,
            Severity::Medium => self.critical + self.high + self.medium,
            Severity::Low => self.critical + self.high + self.medium + self.low,
        }
    }
}

/// Configured blocking criterion for the vulnerability gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GateCriterion {
    /// Never block; scan results are informational.
    Never,
    /// Block on any known vulnerability.
    AnyKnown,
    /// Block only when the new image has more vulnerabilities than the
    /// currently-running one. Requires the current image's summary.
    MoreThanCurrent,
    /// Block when any vulnerability at or above this severity exists.
    MaxSeverity(Severity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Blocked { reason: String },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }
}

/// Pure gate: identical summaries and criterion always yield the identical
/// decision. On `Blocked` the caller discards the temp-tagged image; the gate
/// itself only decides.
pub fn evaluate(
    criterion: GateCriterion,
    new: &ScanSummary,
    current: Option<&ScanSummary>,
) -> GateDecision {
    match criterion {
        GateCriterion::Never => GateDecision::Allowed,
        GateCriterion::AnyKnown => {
            if new.total() > 0 {
                GateDecision::Blocked {
                    reason: format!(
                        "{} known vulnerabilities ({} critical, {} high)",
                        new.total(),
                        new.critical,
                        new.high
                    ),
                }
            } else {
                GateDecision::Allowed
            }
        }
        GateCriterion::MoreThanCurrent => match current {
            Some(current) if new.total() > current.total() => GateDecision::Blocked {
                reason: format!(
                    "new image has {} vulnerabilities, current has {}",
                    new.total(),
                    current.total()
                ),
            },
            Some(_) => GateDecision::Allowed,
            // Without a baseline the comparison degrades to any-known.
            None if new.total() > 0 => GateDecision::Blocked {
                reason: format!(
                    "no baseline for current image and new image has {} vulnerabilities",
                    new.total()
                ),
            },
            None => GateDecision::Allowed,
        },
        GateCriterion::MaxSeverity(threshold) => {
            let count = new.count_at_or_above(threshold);
            if count > 0 {
                GateDecision::Blocked {
                    reason: format!("{} vulnerabilities at or above {:?}", count, threshold),
                }
            } else {
                GateDecision::Allowed
            }
        }
    }
}

/// External scanner collaborator. Progress lines are pushed through the
/// callback incrementally while the scan runs.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(
        &self,
        reference: &ImageReference,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> anyhow::Result<ScanSummary>;
}

/// Summaries keyed by image id, so `MoreThanCurrent` does not re-scan the
/// running image on every cycle.
#[derive(Default)]
pub struct ScanCache {
    by_image_id: RwLock<HashMap<String, ScanSummary>>,
}

impl ScanCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, image_id: &str) -> Option<ScanSummary> {
        self.by_image_id.read().await.get(image_id).cloned()
    }

    pub async fn put(&self, image_id: String, summary: ScanSummary) {
        self.by_image_id.write().await.insert(image_id, summary);
    }
}
