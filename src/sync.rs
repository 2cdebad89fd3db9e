//! Sync Engine - Orchestrates parallel repository mirroring
//!
//! Each repository is one unit of work: make sure the destination exists,
//! bring the local mirror up to date, attach the destination remote, then
//! detect and push branches one after another. Repositories run concurrently
//! up to the configured worker count; a failure anywhere inside one
//! repository is reported for that repository and never stops the others.

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::detect::{ChangeDetector, DetectionErrorPolicy};
use crate::discovery::{self, ExclusionFilter, RemoteProvisioner, Repository, RepositoryLister};
use crate::git::VersionControl;
use crate::history::HistoryHandle;
use crate::mirror::{LocalMirror, RemoteBinding};
use crate::push::{BranchOutcome, BranchPusher};

/// Half the available CPUs, at least one
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    worker_count_for(cores)
}

fn worker_count_for(cores: usize) -> usize {
    (cores / 2).max(1)
}

/// Engine settings derived from configuration
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub working_dir: PathBuf,
    pub remote_name: String,
    pub worker_count: usize,
    pub repository_timeout: Option<Duration>,
    pub detection_policy: DetectionErrorPolicy,
    pub exclusions: ExclusionFilter,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let exclusions = ExclusionFilter::new(&config.source.exclude_patterns)
            .context("Invalid source.exclude_patterns")?;

        Ok(Self {
            working_dir: config.working_dir(),
            remote_name: config.destination.remote_name.clone(),
            worker_count: config.worker_count(),
            repository_timeout: config.repository_timeout(),
            detection_policy: config.sync.on_detection_error,
            exclusions,
        })
    }
}

/// Where in a repository's sync a failure stopped it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonStage {
    Provisioning,
    Mirror,
    Binding,
    History,
    Branches,
    Timeout,
    Panic,
}

impl fmt::Display for AbandonStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbandonStage::Provisioning => "provisioning",
            AbandonStage::Mirror => "local mirror",
            AbandonStage::Binding => "remote binding",
            AbandonStage::History => "sync history",
            AbandonStage::Branches => "branch listing",
            AbandonStage::Timeout => "timeout",
            AbandonStage::Panic => "panic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchReport {
    pub name: String,
    pub outcome: BranchOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoOutcome {
    Completed { branches: Vec<BranchReport> },
    Abandoned { stage: AbandonStage, error: String },
}

/// Result of one repository's sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoReport {
    pub name: String,
    pub outcome: RepoOutcome,
}

impl RepoReport {
    fn abandoned(name: &str, stage: AbandonStage, error: String) -> Self {
        Self {
            name: name.to_string(),
            outcome: RepoOutcome::Abandoned { stage, error },
        }
    }

    pub fn branches(&self) -> &[BranchReport] {
        match &self.outcome {
            RepoOutcome::Completed { branches } => branches.as_slice(),
            RepoOutcome::Abandoned { .. } => &[],
        }
    }

    pub fn branch(&self, name: &str) -> Option<&BranchOutcome> {
        self.branches()
            .iter()
            .find(|report| report.name == name)
            .map(|report| &report.outcome)
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.outcome, RepoOutcome::Abandoned { .. })
    }
}

/// Results from a complete sync pass
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub total_repositories: usize,
    pub completed_repositories: usize,
    pub abandoned_repositories: usize,
    pub branches_pushed: usize,
    pub branches_up_to_date: usize,
    pub branches_failed: usize,
    pub branches_skipped: usize,
    pub duration: Duration,
    pub reports: Vec<RepoReport>,
}

impl SyncSummary {
    pub fn from_reports(reports: Vec<RepoReport>, duration: Duration) -> Self {
        let mut summary = SyncSummary {
            total_repositories: reports.len(),
            completed_repositories: 0,
            abandoned_repositories: 0,
            branches_pushed: 0,
            branches_up_to_date: 0,
            branches_failed: 0,
            branches_skipped: 0,
            duration,
            reports: Vec::new(),
        };

        for report in &reports {
            match &report.outcome {
                RepoOutcome::Abandoned { .. } => summary.abandoned_repositories += 1,
                RepoOutcome::Completed { branches } => {
                    summary.completed_repositories += 1;
                    for branch in branches {
                        match &branch.outcome {
                            BranchOutcome::UpToDate => summary.branches_up_to_date += 1,
                            BranchOutcome::Synced { .. } => summary.branches_pushed += 1,
                            BranchOutcome::PushedUnrecorded { .. } => {
                                summary.branches_pushed += 1;
                                summary.branches_failed += 1;
                            }
                            BranchOutcome::Stale { .. } => summary.branches_failed += 1,
                            BranchOutcome::Skipped { .. } => summary.branches_skipped += 1,
                        }
                    }
                }
            }
        }

        summary.reports = reports;
        summary
    }

    pub fn report(&self, repository: &str) -> Option<&RepoReport> {
        self.reports.iter().find(|report| report.name == repository)
    }
}

/// The engine that mirrors repositories from source to destination
pub struct SyncEngine {
    options: EngineOptions,
    lister: Arc<dyn RepositoryLister>,
    provisioner: Arc<dyn RemoteProvisioner>,
    history: HistoryHandle,
    mirror: LocalMirror,
    binding: RemoteBinding,
    detector: ChangeDetector,
    pusher: BranchPusher,
}

impl SyncEngine {
    /// Wire the engine's components to shared collaborators
    ///
    /// Source credentials are used for clone and fetch, destination
    /// credentials for the destination fetch and every push.
    pub fn new(
        options: EngineOptions,
        vcs: Arc<dyn VersionControl>,
        lister: Arc<dyn RepositoryLister>,
        provisioner: Arc<dyn RemoteProvisioner>,
        history: HistoryHandle,
        source_credentials: Arc<dyn CredentialProvider>,
        destination_credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let mirror = LocalMirror::new(
            vcs.clone(),
            options.working_dir.clone(),
            source_credentials.clone(),
        );
        let binding = RemoteBinding::new(
            vcs.clone(),
            options.remote_name.clone(),
            destination_credentials.clone(),
        );
        let detector = ChangeDetector::new(vcs.clone(), source_credentials, options.detection_policy);
        let pusher = BranchPusher::new(vcs, destination_credentials, history.clone());

        Self {
            options,
            lister,
            provisioner,
            history,
            mirror,
            binding,
            detector,
            pusher,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// List the source and apply exclusions
    pub async fn discover(&self) -> Result<Vec<Repository>> {
        discovery::discover(
            self.lister.as_ref(),
            self.provisioner.as_ref(),
            &self.options.exclusions,
        )
        .await
    }

    /// Run a complete pass: discover repositories and mirror them
    pub async fn run_once(&self) -> Result<SyncSummary> {
        let repositories = self
            .discover()
            .await
            .context("Failed to discover repositories")?;

        Ok(self.run(repositories).await)
    }

    /// Mirror `repositories` with bounded parallelism
    pub async fn run(&self, repositories: Vec<Repository>) -> SyncSummary {
        let start_time = Instant::now();
        let workers = self.options.worker_count.max(1);

        info!(
            "Syncing {} repositories with {} workers",
            repositories.len(),
            workers
        );

        let semaphore = Semaphore::new(workers);
        let mut futures = FuturesUnordered::new();

        for repository in repositories {
            let semaphore = &semaphore;
            futures.push(async move {
                // Local to this pass and never closed
                let _permit = semaphore.acquire().await.expect("Semaphore closed");
                self.sync_guarded(&repository).await
            });
        }

        let mut reports = Vec::new();
        while let Some(report) = futures.next().await {
            reports.push(report);
        }

        let summary = SyncSummary::from_reports(reports, start_time.elapsed());

        info!(
            "Sync completed in {:.2}s: {} repositories ({} abandoned), {} branches pushed, {} up to date, {} failed, {} skipped",
            summary.duration.as_secs_f64(),
            summary.total_repositories,
            summary.abandoned_repositories,
            summary.branches_pushed,
            summary.branches_up_to_date,
            summary.branches_failed,
            summary.branches_skipped
        );

        summary
    }

    /// Sync one repository, turning timeouts and panics into reports
    async fn sync_guarded(&self, repository: &Repository) -> RepoReport {
        let work = AssertUnwindSafe(self.sync_repository(repository)).catch_unwind();

        let result = match self.options.repository_timeout {
            Some(limit) => match timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Sync of {} timed out after {}s",
                        repository.name,
                        limit.as_secs()
                    );
                    return RepoReport::abandoned(
                        &repository.name,
                        AbandonStage::Timeout,
                        format!("timed out after {}s", limit.as_secs()),
                    );
                }
            },
            None => work.await,
        };

        result.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!("Sync of {} panicked: {}", repository.name, message);
            RepoReport::abandoned(&repository.name, AbandonStage::Panic, message)
        })
    }

    async fn sync_repository(&self, repository: &Repository) -> RepoReport {
        match self.sync_branches(repository).await {
            Ok(branches) => RepoReport {
                name: repository.name.clone(),
                outcome: RepoOutcome::Completed { branches },
            },
            Err((stage, e)) => {
                error!(
                    "Abandoning {} at {}: {:#}",
                    repository.name, stage, e
                );
                RepoReport::abandoned(&repository.name, stage, format!("{:#}", e))
            }
        }
    }

    async fn sync_branches(
        &self,
        repository: &Repository,
    ) -> Result<Vec<BranchReport>, (AbandonStage, anyhow::Error)> {
        debug!("Starting sync of {}", repository.name);

        self.provisioner
            .ensure_repository(&repository.name)
            .await
            .map_err(|e| (AbandonStage::Provisioning, e))?;

        let handle = self
            .mirror
            .ensure(repository)
            .await
            .map_err(|e| (AbandonStage::Mirror, anyhow::Error::from(e)))?;
        self.mirror
            .refresh(&handle)
            .await
            .map_err(|e| (AbandonStage::Mirror, anyhow::Error::from(e)))?;

        let destination = self
            .binding
            .bind(&handle, &repository.destination_url)
            .await
            .map_err(|e| (AbandonStage::Binding, anyhow::Error::from(e)))?;

        let snapshot = self
            .history
            .snapshot(&repository.name)
            .await
            .map_err(|e| (AbandonStage::History, anyhow::Error::from(e)))?;

        let branches = self
            .mirror
            .source_branches(&handle)
            .await
            .map_err(|e| (AbandonStage::Branches, anyhow::Error::from(e)))?;

        debug!("{} has {} branches", repository.name, branches.len());
        self.binding.clear_conflicts(&destination, &branches).await;

        let mut reports = Vec::with_capacity(branches.len());
        for branch in branches {
            let detection = self.detector.detect(&handle, &branch.name, &snapshot).await;

            let outcome = match self.detector.settle_without_push(&detection) {
                Some(outcome) => outcome,
                None => self.pusher.push(&destination, &branch.name, &detection).await,
            };

            debug!("{}:{} {}", repository.name, branch.name, outcome);
            reports.push(BranchReport {
                name: branch.name,
                outcome,
            });
        }

        Ok(reports)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
