//! Sync History - durable record of the last commit mirrored per branch
//!
//! The record is one JSON object on disk:
//!
//! ```json
//! { "demo": { "main": "3f2a...", "develop": "91bc..." } }
//! ```
//!
//! A missing or unreadable file is treated as an empty history. Writes go to
//! `<file>.tmp` first and are renamed over the original.
//!
//! Workers never touch the file directly. [`HistoryService`] owns the
//! [`SyncHistoryStore`] on a dedicated blocking thread and applies every
//! update in arrival order, saving after each one; workers talk to it through
//! a cloneable [`HistoryHandle`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const HISTORY_CHANNEL_BUFFER: usize = 64;

/// Branch name -> last synced commit, for one repository
pub type BranchHistory = BTreeMap<String, String>;

/// Errors raised while persisting or querying the sync history
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to write sync history to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize sync history: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sync history service is not running")]
    ServiceStopped,
}

/// Repository name -> branch history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncRecord {
    repositories: BTreeMap<String, BranchHistory>,
}

impl SyncRecord {
    pub fn get(&self, repository: &str, branch: &str) -> Option<&str> {
        self.repositories
            .get(repository)
            .and_then(|branches| branches.get(branch))
            .map(String::as_str)
    }

    /// Set a branch's commit, returning the value it replaced
    pub fn set(&mut self, repository: &str, branch: &str, commit: &str) -> Option<String> {
        self.repositories
            .entry(repository.to_string())
            .or_default()
            .insert(branch.to_string(), commit.to_string())
    }

    /// Put back what `set` replaced
    fn restore(&mut self, repository: &str, branch: &str, previous: Option<String>) {
        match previous {
            Some(commit) => {
                self.set(repository, branch, &commit);
            }
            None => {
                if let Some(branches) = self.repositories.get_mut(repository) {
                    branches.remove(branch);
                    if branches.is_empty() {
                        self.repositories.remove(repository);
                    }
                }
            }
        }
    }

    /// Copy of one repository's branch history (empty if never synced)
    pub fn repository(&self, repository: &str) -> BranchHistory {
        self.repositories.get(repository).cloned().unwrap_or_default()
    }

    pub fn repositories(&self) -> impl Iterator<Item = (&String, &BranchHistory)> {
        self.repositories.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    /// Total number of tracked branches across all repositories
    pub fn branch_count(&self) -> usize {
        self.repositories.values().map(BTreeMap::len).sum()
    }
}

/// File-backed sync record
#[derive(Debug)]
pub struct SyncHistoryStore {
    path: PathBuf,
    record: SyncRecord,
}

impl SyncHistoryStore {
    /// Load the history at `path`.
    ///
    /// Never fails: a missing file starts an empty history, and a corrupt or
    /// unreadable one is logged and treated as empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = Self::read_record(&path);
        Self { path, record }
    }

    fn read_record(path: &Path) -> SyncRecord {
        if !path.exists() {
            debug!("No sync history at {}, starting empty", path.display());
            return SyncRecord::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "Failed to read sync history {}, starting empty: {}",
                    path.display(),
                    e
                );
                return SyncRecord::default();
            }
        };

        match serde_json::from_str::<SyncRecord>(&content) {
            Ok(record) => {
                info!(
                    "Loaded sync history for {} branches from {}",
                    record.branch_count(),
                    path.display()
                );
                record
            }
            Err(e) => {
                warn!(
                    "Sync history {} is corrupt, starting empty: {}",
                    path.display(),
                    e
                );
                SyncRecord::default()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &SyncRecord {
        &self.record
    }

    pub fn into_record(self) -> SyncRecord {
        self.record
    }

    pub fn get(&self, repository: &str, branch: &str) -> Option<&str> {
        self.record.get(repository, branch)
    }

    pub fn repository(&self, repository: &str) -> BranchHistory {
        self.record.repository(repository)
    }

    /// Record a synced commit and persist immediately.
    ///
    /// If the write fails the in-memory entry is rolled back, so the store
    /// never claims a branch is synced when the file says otherwise.
    pub fn set(&mut self, repository: &str, branch: &str, commit: &str) -> Result<(), HistoryError> {
        let previous = self.record.set(repository, branch, commit);

        if let Err(e) = self.save() {
            self.record.restore(repository, branch, previous);
            return Err(e);
        }

        debug!("Recorded {}:{} -> {}", repository, branch, commit);
        Ok(())
    }

    /// Atomically overwrite the persisted history
    pub fn save(&self) -> Result<(), HistoryError> {
        let persist_err = |source| HistoryError::Persist {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(persist_err)?;
            }
        }

        let json = serde_json::to_string_pretty(&self.record)?;
        let tmp = Self::tmp_path(&self.path);
        std::fs::write(&tmp, json).map_err(persist_err)?;
        std::fs::rename(&tmp, &self.path).map_err(persist_err)?;
        Ok(())
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "sync_history.json".into());
        name.push(".tmp");
        path.with_file_name(name)
    }
}

enum Command {
    Snapshot {
        repository: String,
        reply: oneshot::Sender<BranchHistory>,
    },
    Get {
        repository: String,
        branch: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Record {
        repository: String,
        branch: String,
        commit: String,
        reply: oneshot::Sender<Result<(), HistoryError>>,
    },
    Shutdown {
        reply: oneshot::Sender<SyncRecord>,
    },
}

/// Single writer for the sync history
pub struct HistoryService;

impl HistoryService {
    /// Move `store` onto a blocking thread and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: SyncHistoryStore) -> HistoryHandle {
        let (tx, rx) = mpsc::channel(HISTORY_CHANNEL_BUFFER);
        tokio::task::spawn_blocking(move || Self::serve(store, rx));
        HistoryHandle { tx }
    }

    fn serve(mut store: SyncHistoryStore, mut rx: mpsc::Receiver<Command>) {
        debug!("Sync history service started for {}", store.path().display());

        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Snapshot { repository, reply } => {
                    let _ = reply.send(store.repository(&repository));
                }
                Command::Get {
                    repository,
                    branch,
                    reply,
                } => {
                    let _ = reply.send(store.get(&repository, &branch).map(str::to_string));
                }
                Command::Record {
                    repository,
                    branch,
                    commit,
                    reply,
                } => {
                    let _ = reply.send(store.set(&repository, &branch, &commit));
                }
                Command::Shutdown { reply } => {
                    rx.close();
                    let _ = reply.send(store.into_record());
                    return;
                }
            }
        }

        debug!("Sync history service stopped");
    }
}

/// Cloneable handle to the [`HistoryService`]
#[derive(Clone)]
pub struct HistoryHandle {
    tx: mpsc::Sender<Command>,
}

impl HistoryHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HistoryError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| HistoryError::ServiceStopped)?;
        response.await.map_err(|_| HistoryError::ServiceStopped)
    }

    /// Branch history of one repository as of now
    pub async fn snapshot(&self, repository: &str) -> Result<BranchHistory, HistoryError> {
        let repository = repository.to_string();
        self.request(|reply| Command::Snapshot { repository, reply })
            .await
    }

    pub async fn last_synced(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<Option<String>, HistoryError> {
        let repository = repository.to_string();
        let branch = branch.to_string();
        self.request(|reply| Command::Get {
            repository,
            branch,
            reply,
        })
        .await
    }

    /// Record a synced commit; resolves once it is on disk
    pub async fn record(
        &self,
        repository: &str,
        branch: &str,
        commit: &str,
    ) -> Result<(), HistoryError> {
        let repository = repository.to_string();
        let branch = branch.to_string();
        let commit = commit.to_string();
        self.request(|reply| Command::Record {
            repository,
            branch,
            commit,
            reply,
        })
        .await?
    }

    /// Stop the service after all queued commands and return the final record
    pub async fn shutdown(self) -> Result<SyncRecord, HistoryError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
