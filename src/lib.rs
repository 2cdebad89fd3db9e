//! repomirror - Bitbucket to Azure DevOps repository mirroring
//!
//! repomirror replicates every branch of every repository in a Bitbucket
//! workspace to an Azure DevOps project. Runs are idempotent: the last commit
//! pushed for each branch is recorded, and only branches whose tip moved are
//! pushed again.
//!
//! ## Core Features
//!
//! - **Discovery**: paginated Bitbucket listing with glob exclusions
//! - **Provisioning**: destination repositories are created on demand
//! - **Change Detection**: per-branch comparison against the sync history
//! - **Durable History**: single-writer JSON record, saved after every push
//! - **Bounded Parallelism**: repositories are mirrored concurrently, each in
//!   isolation
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration and environment overrides
//! - [`sync`]: the orchestrating [`SyncEngine`]
//! - [`history`]: sync history store and its writer service
//! - [`git`]: version-control primitives and the `git` CLI driver

pub mod azure;
pub mod bitbucket;
pub mod config;
pub mod credentials;
pub mod detect;
pub mod discovery;
pub mod git;
pub mod history;
pub mod logging;
pub mod mirror;
pub mod push;
pub mod sync;

pub use azure::AzureDevOpsClient;
pub use bitbucket::BitbucketClient;
pub use config::Config;
pub use credentials::{Credential, CredentialProvider, EnvTokenProvider, StaticCredentials};
pub use detect::{ChangeDetector, Detection, DetectionErrorPolicy};
pub use discovery::{ExclusionFilter, RemoteProvisioner, Repository, RepositoryLister, SourceRepository};
pub use git::{BranchRef, GitCli, VersionControl};
pub use history::{HistoryHandle, HistoryService, SyncHistoryStore, SyncRecord};
pub use mirror::{LocalMirror, MirrorError, MirrorHandle, RemoteBinding};
pub use push::{BranchOutcome, BranchPusher, PushError};
pub use sync::{AbandonStage, EngineOptions, RepoOutcome, RepoReport, SyncEngine, SyncSummary};
