//! Forced replication of one branch to the destination
//!
//! A successful push is recorded in the sync history before the outcome is
//! reported, so the history never runs ahead of the destination.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::credentials::CredentialProvider;
use crate::detect::Detection;
use crate::git::VersionControl;
use crate::history::HistoryHandle;
use crate::mirror::DestinationRemote;

/// A forced push that did not go through
#[derive(Debug, Error)]
#[error("failed to push {repository}:{branch} to {remote}")]
pub struct PushError {
    pub repository: String,
    pub branch: String,
    pub remote: String,
    #[source]
    pub source: anyhow::Error,
}

/// What happened to one branch during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Recorded commit matches the source; nothing pushed
    UpToDate,
    /// Pushed and recorded
    Synced { commit: String },
    /// Pushed, but the sync history could not be updated
    PushedUnrecorded { reason: String },
    /// Push failed; the destination may lag the source
    Stale { error: String },
    /// Deliberately not pushed
    Skipped { reason: String },
}

impl BranchOutcome {
    /// Whether the destination received a push for this branch
    pub fn pushed(&self) -> bool {
        matches!(
            self,
            BranchOutcome::Synced { .. } | BranchOutcome::PushedUnrecorded { .. }
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BranchOutcome::Stale { .. } | BranchOutcome::PushedUnrecorded { .. }
        )
    }
}

impl fmt::Display for BranchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchOutcome::UpToDate => write!(f, "up to date"),
            BranchOutcome::Synced { commit } => write!(f, "synced at {}", short_commit(commit)),
            BranchOutcome::PushedUnrecorded { reason } => {
                write!(f, "pushed but not recorded: {}", reason)
            }
            BranchOutcome::Stale { error } => write!(f, "stale: {}", error),
            BranchOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

fn short_commit(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

pub struct BranchPusher {
    vcs: Arc<dyn VersionControl>,
    credentials: Arc<dyn CredentialProvider>,
    history: HistoryHandle,
}

impl BranchPusher {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        credentials: Arc<dyn CredentialProvider>,
        history: HistoryHandle,
    ) -> Self {
        Self {
            vcs,
            credentials,
            history,
        }
    }

    /// Force the destination branch to the local branch's tip
    pub async fn push_branch(
        &self,
        destination: &DestinationRemote,
        branch: &str,
    ) -> Result<(), PushError> {
        self.vcs
            .push_force(
                &destination.path,
                &destination.name,
                branch,
                self.credentials.as_ref(),
            )
            .await
            .map_err(|source| PushError {
                repository: destination.repository.clone(),
                branch: branch.to_string(),
                remote: destination.name.clone(),
                source,
            })
    }

    /// Push `branch` and record the commit it was detected at
    pub async fn push(
        &self,
        destination: &DestinationRemote,
        branch: &str,
        detection: &Detection,
    ) -> BranchOutcome {
        if let Err(e) = self.push_branch(destination, branch).await {
            let error = format!("{:#}", anyhow::Error::new(e));
            error!("{}", error);
            return BranchOutcome::Stale { error };
        }

        let Some(commit) = detection.current_commit() else {
            warn!(
                "Pushed {}:{} without a known commit; history not updated",
                destination.repository, branch
            );
            return BranchOutcome::PushedUnrecorded {
                reason: "current commit unknown".to_string(),
            };
        };

        match self
            .history
            .record(&destination.repository, branch, commit)
            .await
        {
            Ok(()) => {
                info!(
                    "Synced {}:{} at {}",
                    destination.repository,
                    branch,
                    short_commit(commit)
                );
                BranchOutcome::Synced {
                    commit: commit.to_string(),
                }
            }
            Err(e) => {
                error!(
                    "Pushed {}:{} but failed to record it: {}",
                    destination.repository, branch, e
                );
                BranchOutcome::PushedUnrecorded {
                    reason: e.to_string(),
                }
            }
        }
    }
}
