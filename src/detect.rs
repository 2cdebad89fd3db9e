//! Per-branch change detection
//!
//! A branch needs replication when its current tip differs from the commit
//! recorded in the sync history, or when nothing has been recorded yet. When
//! the tip cannot be read at all, [`DetectionErrorPolicy`] decides.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::credentials::CredentialProvider;
use crate::git::{VersionControl, SOURCE_REMOTE};
use crate::history::BranchHistory;
use crate::mirror::MirrorHandle;
use crate::push::BranchOutcome;

/// What to do with a branch whose current commit could not be determined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionErrorPolicy {
    /// Push anyway; a redundant forced push is harmless
    #[default]
    AssumeChanged,
    /// Leave the branch alone until a later run can read it
    AssumeUnchanged,
}

/// Result of comparing a branch tip against the sync history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    UpToDate {
        commit: String,
    },
    Changed {
        commit: String,
        previous: Option<String>,
    },
    Undetermined {
        reason: String,
    },
}

impl Detection {
    /// Compare a freshly read tip with the recorded one
    pub fn compare(commit: String, recorded: Option<&str>) -> Self {
        match recorded {
            Some(previous) if previous == commit => Detection::UpToDate { commit },
            previous => Detection::Changed {
                commit,
                previous: previous.map(str::to_string),
            },
        }
    }

    /// Tip the branch was at when it was inspected, if it could be read
    pub fn current_commit(&self) -> Option<&str> {
        match self {
            Detection::UpToDate { commit } | Detection::Changed { commit, .. } => Some(commit),
            Detection::Undetermined { .. } => None,
        }
    }
}

pub struct ChangeDetector {
    vcs: Arc<dyn VersionControl>,
    credentials: Arc<dyn CredentialProvider>,
    policy: DetectionErrorPolicy,
}

impl ChangeDetector {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        credentials: Arc<dyn CredentialProvider>,
        policy: DetectionErrorPolicy,
    ) -> Self {
        Self {
            vcs,
            credentials,
            policy,
        }
    }

    pub fn policy(&self) -> DetectionErrorPolicy {
        self.policy
    }

    /// Bring `branch` level with the source and compare it to `snapshot`
    ///
    /// Never fails; any error along the way is reported as
    /// [`Detection::Undetermined`].
    pub async fn detect(
        &self,
        handle: &MirrorHandle,
        branch: &str,
        snapshot: &BranchHistory,
    ) -> Detection {
        match self.current_tip(handle, branch).await {
            Ok(commit) => {
                let detection =
                    Detection::compare(commit, snapshot.get(branch).map(String::as_str));
                debug!("{}:{} -> {:?}", handle.repository, branch, detection);
                detection
            }
            Err(e) => {
                warn!(
                    "Could not determine current commit of {}:{}: {:#}",
                    handle.repository, branch, e
                );
                Detection::Undetermined {
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    async fn current_tip(&self, handle: &MirrorHandle, branch: &str) -> Result<String> {
        self.vcs
            .fetch(&handle.path, SOURCE_REMOTE, self.credentials.as_ref())
            .await?;
        self.vcs
            .checkout_tracking(&handle.path, SOURCE_REMOTE, branch)
            .await?;
        self.vcs.branch_tip(&handle.path, branch).await
    }

    /// Outcome of a branch that is settled without pushing, or `None` when
    /// it has to be pushed
    pub fn settle_without_push(&self, detection: &Detection) -> Option<BranchOutcome> {
        match detection {
            Detection::UpToDate { .. } => Some(BranchOutcome::UpToDate),
            Detection::Changed { .. } => None,
            Detection::Undetermined { reason } => match self.policy {
                DetectionErrorPolicy::AssumeChanged => {
                    debug!("Pushing undetermined branch anyway: {}", reason);
                    None
                }
                DetectionErrorPolicy::AssumeUnchanged => {
                    warn!("Skipping undetermined branch: {}", reason);
                    Some(BranchOutcome::Skipped {
                        reason: reason.clone(),
                    })
                }
            },
        }
    }

    /// Whether a branch with this detection result should be pushed
    pub fn needs_push(&self, detection: &Detection) -> bool {
        self.settle_without_push(detection).is_none()
    }
}
