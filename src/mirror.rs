//! Local mirrors and their destination remote
//!
//! Each repository gets one working copy under the working directory, named
//! after the repository. The source is always the `origin` remote; the
//! destination is attached as a second remote that is recreated on every run
//! so a changed destination URL takes effect immediately.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credentials::CredentialProvider;
use crate::discovery::Repository;
use crate::git::{branches_conflict, BranchRef, VersionControl, SOURCE_REMOTE};

/// Failures that end a repository's sync
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("{} exists but is not a git repository", .path.display())]
    NotARepository { path: PathBuf },

    #[error("failed to clone {repository}")]
    Clone {
        repository: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to fetch {repository} from the source")]
    Fetch {
        repository: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to attach remote {remote} to {repository}")]
    Bind {
        repository: String,
        remote: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to list branches of {repository}")]
    ListBranches {
        repository: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to prepare working directory {}", .path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A local working copy ready for use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorHandle {
    pub repository: String,
    pub path: PathBuf,
}

/// Maintains the local working copies of source repositories
pub struct LocalMirror {
    vcs: Arc<dyn VersionControl>,
    working_dir: PathBuf,
    credentials: Arc<dyn CredentialProvider>,
}

impl LocalMirror {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        working_dir: impl Into<PathBuf>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            vcs,
            working_dir: working_dir.into(),
            credentials,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn path_for(&self, repository: &str) -> PathBuf {
        self.working_dir.join(repository)
    }

    /// Return the local copy of `repository`, cloning it if there is none
    pub async fn ensure(&self, repository: &Repository) -> Result<MirrorHandle, MirrorError> {
        let path = self.path_for(&repository.name);
        let handle = MirrorHandle {
            repository: repository.name.clone(),
            path: path.clone(),
        };

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| MirrorError::WorkingDirectory {
                path: path.clone(),
                source,
            })?;

        if exists {
            if !self.vcs.is_repository(&path).await {
                return Err(MirrorError::NotARepository { path });
            }
            debug!("Reusing local mirror {}", path.display());
            return Ok(handle);
        }

        tokio::fs::create_dir_all(&self.working_dir)
            .await
            .map_err(|source| MirrorError::WorkingDirectory {
                path: self.working_dir.clone(),
                source,
            })?;

        info!("Cloning {} into {}", repository.name, path.display());
        if let Err(source) = self
            .vcs
            .clone_repo(
                &repository.source_clone_url,
                &path,
                self.credentials.as_ref(),
            )
            .await
        {
            // A half-written clone would be rejected as NotARepository on
            // every later run.
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    warn!("Failed to remove partial clone {}: {}", path.display(), e);
                }
            }
            return Err(MirrorError::Clone {
                repository: repository.name.clone(),
                source,
            });
        }

        Ok(handle)
    }

    /// Fetch every reference of the source remote and drop local branches
    /// the source no longer has
    pub async fn refresh(&self, handle: &MirrorHandle) -> Result<(), MirrorError> {
        self.vcs
            .fetch(&handle.path, SOURCE_REMOTE, self.credentials.as_ref())
            .await
            .map_err(|source| MirrorError::Fetch {
                repository: handle.repository.clone(),
                source,
            })?;

        // A leftover `feature` would block checking out `feature/x`.
        if let Err(e) = self.prune_local_branches(handle).await {
            warn!(
                "Could not prune local branches of {}: {:#}",
                handle.repository, e
            );
        }
        Ok(())
    }

    /// Delete local branches without a source counterpart, returning how
    /// many were removed
    pub async fn prune_local_branches(&self, handle: &MirrorHandle) -> anyhow::Result<usize> {
        let source: HashSet<String> = self
            .vcs
            .remote_branches(&handle.path, SOURCE_REMOTE)
            .await?
            .into_iter()
            .map(|branch| branch.name)
            .collect();

        let mut removed = 0;
        for branch in self.vcs.local_branches(&handle.path).await? {
            if source.contains(&branch) {
                continue;
            }
            debug!("Deleting local branch {} of {}", branch, handle.repository);
            self.vcs.delete_branch(&handle.path, &branch).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Branches currently on the source, `HEAD` excluded
    pub async fn source_branches(&self, handle: &MirrorHandle) -> Result<Vec<BranchRef>, MirrorError> {
        self.vcs
            .remote_branches(&handle.path, SOURCE_REMOTE)
            .await
            .map_err(|source| MirrorError::ListBranches {
                repository: handle.repository.clone(),
                source,
            })
    }
}

/// A mirror with its destination remote attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRemote {
    pub repository: String,
    pub path: PathBuf,
    pub name: String,
}

/// Attaches the destination remote to local mirrors
pub struct RemoteBinding {
    vcs: Arc<dyn VersionControl>,
    remote_name: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl RemoteBinding {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        remote_name: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            vcs,
            remote_name: remote_name.into(),
            credentials,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// (Re)create the destination remote pointing at `destination_url`
    pub async fn bind(
        &self,
        handle: &MirrorHandle,
        destination_url: &str,
    ) -> Result<DestinationRemote, MirrorError> {
        let bind_err = |source| MirrorError::Bind {
            repository: handle.repository.clone(),
            remote: self.remote_name.clone(),
            source,
        };

        let remotes = self.vcs.remotes(&handle.path).await.map_err(bind_err)?;
        if remotes.iter().any(|name| name == &self.remote_name) {
            debug!(
                "Replacing remote {} in {}",
                self.remote_name, handle.repository
            );
            self.vcs
                .remove_remote(&handle.path, &self.remote_name)
                .await
                .map_err(bind_err)?;
        }

        self.vcs
            .add_remote(&handle.path, &self.remote_name, destination_url)
            .await
            .map_err(bind_err)?;

        // A freshly created destination has nothing to fetch yet.
        if let Err(e) = self
            .vcs
            .fetch(&handle.path, &self.remote_name, self.credentials.as_ref())
            .await
        {
            warn!(
                "Could not fetch {} for {}: {:#}",
                self.remote_name, handle.repository, e
            );
        }

        Ok(DestinationRemote {
            repository: handle.repository.clone(),
            path: handle.path.clone(),
            name: self.remote_name.clone(),
        })
    }

    /// Delete destination branches that are gone from the source and whose
    /// names collide with a source branch (`feature` against `feature/x`)
    ///
    /// Such a branch makes every push of the colliding source branch fail.
    /// Returns the names that were deleted; failures are logged and left for
    /// the push to report.
    pub async fn clear_conflicts(
        &self,
        destination: &DestinationRemote,
        source: &[BranchRef],
    ) -> Vec<String> {
        let existing = match self
            .vcs
            .remote_branches(&destination.path, &destination.name)
            .await
        {
            Ok(branches) => branches,
            Err(e) => {
                warn!(
                    "Could not list {} branches of {}: {:#}",
                    destination.name, destination.repository, e
                );
                return Vec::new();
            }
        };

        let source_names: HashSet<&str> = source.iter().map(|b| b.name.as_str()).collect();
        let mut deleted = Vec::new();

        for stale in existing.iter().filter(|branch| {
            !source_names.contains(branch.name.as_str())
                && source_names
                    .iter()
                    .any(|name| branches_conflict(name, &branch.name))
        }) {
            match self
                .vcs
                .delete_remote_branch(
                    &destination.path,
                    &destination.name,
                    &stale.name,
                    self.credentials.as_ref(),
                )
                .await
            {
                Ok(()) => {
                    info!(
                        "Deleted {}:{} from {}, it blocks a source branch",
                        destination.repository, stale.name, destination.name
                    );
                    deleted.push(stale.name.clone());
                }
                Err(e) => warn!(
                    "Could not delete {}:{} from {}: {:#}",
                    destination.repository, stale.name, destination.name, e
                ),
            }
        }

        deleted
    }
}
