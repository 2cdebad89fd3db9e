//! Common test utilities and fakes for repomirror tests
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

use repomirror::detect::DetectionErrorPolicy;
use repomirror::discovery::{ExclusionFilter, RemoteProvisioner, RepositoryLister, SourceRepository};
use repomirror::git::{branches_conflict, BranchRef, VersionControl, SOURCE_REMOTE};
use repomirror::{
    Credential, CredentialProvider, EngineOptions, HistoryService, StaticCredentials, SyncEngine,
    SyncHistoryStore, SyncRecord, SyncSummary,
};

pub fn source_url(name: &str) -> String {
    format!("fake://source/{}", name)
}

pub fn destination_url(name: &str) -> String {
    format!("fake://dest/{}", name)
}

pub fn credentials() -> Arc<dyn CredentialProvider> {
    Arc::new(StaticCredentials::new(Credential::new("bot", "token")))
}

/// One push that reached a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub repository: String,
    pub branch: String,
    pub commit: String,
}

#[derive(Debug, Default)]
struct MirrorState {
    /// Remote-tracking branches of origin
    fetched: BTreeMap<String, String>,
    local: BTreeMap<String, String>,
    remotes: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    sources: HashMap<String, BTreeMap<String, String>>,
    destinations: HashMap<String, BTreeMap<String, String>>,
    mirrors: HashMap<PathBuf, MirrorState>,
    pushes: Vec<PushRecord>,
    push_attempts: usize,
    clones: usize,
    failing_pushes: HashSet<(String, String)>,
    failing_tips: HashSet<(String, String)>,
    panicking_clones: HashSet<String>,
    slow_clones: HashMap<String, Duration>,
}

/// In-memory [`VersionControl`] with scriptable failures
#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<State>,
    clone_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn repository_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or replace a source repository's branches
    pub fn set_source(&self, name: &str, branches: &[(&str, &str)]) {
        let branches = branches
            .iter()
            .map(|(branch, commit)| (branch.to_string(), commit.to_string()))
            .collect();
        self.state().sources.insert(source_url(name), branches);
    }

    pub fn set_source_branch(&self, name: &str, branch: &str, commit: &str) {
        self.state()
            .sources
            .entry(source_url(name))
            .or_default()
            .insert(branch.to_string(), commit.to_string());
    }

    pub fn remove_source_branch(&self, name: &str, branch: &str) {
        if let Some(branches) = self.state().sources.get_mut(&source_url(name)) {
            branches.remove(branch);
        }
    }

    pub fn fail_push(&self, name: &str, branch: &str) {
        self.state()
            .failing_pushes
            .insert((name.to_string(), branch.to_string()));
    }

    pub fn clear_push_failures(&self) {
        self.state().failing_pushes.clear();
    }

    /// Make reading the tip of `branch` fail
    pub fn fail_tip(&self, name: &str, branch: &str) {
        self.state()
            .failing_tips
            .insert((name.to_string(), branch.to_string()));
    }

    pub fn panic_on_clone(&self, name: &str) {
        self.state().panicking_clones.insert(source_url(name));
    }

    pub fn slow_clone(&self, name: &str, delay: Duration) {
        self.state().slow_clones.insert(source_url(name), delay);
    }

    pub fn set_clone_delay(&self, delay: Duration) {
        *self.clone_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.state().pushes.clone()
    }

    pub fn push_count(&self) -> usize {
        self.state().pushes.len()
    }

    pub fn push_attempts(&self) -> usize {
        self.state().push_attempts
    }

    pub fn clone_count(&self) -> usize {
        self.state().clones
    }

    pub fn max_concurrent_clones(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn destination_branch(&self, name: &str, branch: &str) -> Option<String> {
        self.state()
            .destinations
            .get(&destination_url(name))
            .and_then(|branches| branches.get(branch).cloned())
    }

    pub fn destination_branches(&self, name: &str) -> Vec<String> {
        self.state()
            .destinations
            .get(&destination_url(name))
            .map(|branches| branches.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_branch_names(&self, path: &Path) -> Vec<String> {
        self.state()
            .mirrors
            .get(path)
            .map(|mirror| mirror.local.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remote_url(&self, path: &Path, remote: &str) -> Option<String> {
        self.state()
            .mirrors
            .get(path)
            .and_then(|mirror| mirror.remotes.get(remote).cloned())
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn is_repository(&self, path: &Path) -> bool {
        self.state().mirrors.contains_key(path)
    }

    async fn clone_repo(
        &self,
        url: &str,
        path: &Path,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        credentials.credential()?;

        let (panics, slow) = {
            let state = self.state();
            (
                state.panicking_clones.contains(url),
                state.slow_clones.get(url).copied(),
            )
        };
        if panics {
            panic!("clone of {} blew up", url);
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.clone_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = slow.or(delay) {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state();
        let branches = state
            .sources
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("repository {} not found", url))?;

        std::fs::create_dir_all(path)?;
        let mut mirror = MirrorState {
            fetched: branches,
            ..Default::default()
        };
        mirror
            .remotes
            .insert(SOURCE_REMOTE.to_string(), url.to_string());
        state.mirrors.insert(path.to_path_buf(), mirror);
        state.clones += 1;
        Ok(())
    }

    async fn fetch(
        &self,
        path: &Path,
        remote: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        credentials.credential()?;

        let mut state = self.state();
        let url = state
            .mirrors
            .get(path)
            .and_then(|mirror| mirror.remotes.get(remote).cloned())
            .ok_or_else(|| anyhow!("no remote {} in {}", remote, path.display()))?;

        if remote != SOURCE_REMOTE {
            return if state.destinations.contains_key(&url) {
                Ok(())
            } else {
                Err(anyhow!("repository {} is empty", url))
            };
        }

        let branches = state
            .sources
            .get(&url)
            .cloned()
            .ok_or_else(|| anyhow!("repository {} not found", url))?;
        if let Some(mirror) = state.mirrors.get_mut(path) {
            mirror.fetched = branches;
        }
        Ok(())
    }

    async fn remote_branches(&self, path: &Path, remote: &str) -> Result<Vec<BranchRef>> {
        let state = self.state();
        let mirror = state
            .mirrors
            .get(path)
            .ok_or_else(|| anyhow!("{} is not a repository", path.display()))?;

        let branches = if remote == SOURCE_REMOTE {
            &mirror.fetched
        } else {
            match mirror
                .remotes
                .get(remote)
                .and_then(|url| state.destinations.get(url))
            {
                Some(branches) => branches,
                None => return Ok(Vec::new()),
            }
        };

        Ok(branches
            .iter()
            .filter(|(name, _)| name.as_str() != "HEAD")
            .map(|(name, tip)| BranchRef {
                name: name.clone(),
                tip: tip.clone(),
            })
            .collect())
    }

    async fn checkout_tracking(&self, path: &Path, _remote: &str, branch: &str) -> Result<()> {
        let mut state = self.state();
        let mirror = state
            .mirrors
            .get_mut(path)
            .ok_or_else(|| anyhow!("{} is not a repository", path.display()))?;
        let tip = mirror
            .fetched
            .get(branch)
            .cloned()
            .ok_or_else(|| anyhow!("no remote branch {}", branch))?;
        if let Some(blocking) = mirror
            .local
            .keys()
            .find(|name| branches_conflict(name, branch))
        {
            return Err(anyhow!("cannot create {}: {} exists", branch, blocking));
        }
        mirror.local.insert(branch.to_string(), tip);
        Ok(())
    }

    async fn branch_tip(&self, path: &Path, branch: &str) -> Result<String> {
        let state = self.state();
        if state
            .failing_tips
            .contains(&(repository_of(path), branch.to_string()))
        {
            return Err(anyhow!("rev-parse failed for {}", branch));
        }
        state
            .mirrors
            .get(path)
            .and_then(|mirror| mirror.local.get(branch).cloned())
            .ok_or_else(|| anyhow!("no local branch {}", branch))
    }

    async fn local_branches(&self, path: &Path) -> Result<Vec<String>> {
        let state = self.state();
        let mirror = state
            .mirrors
            .get(path)
            .ok_or_else(|| anyhow!("{} is not a repository", path.display()))?;
        Ok(mirror.local.keys().cloned().collect())
    }

    async fn delete_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let mut state = self.state();
        state
            .mirrors
            .get_mut(path)
            .and_then(|mirror| mirror.local.remove(branch))
            .map(|_| ())
            .ok_or_else(|| anyhow!("no local branch {}", branch))
    }

    async fn delete_remote_branch(
        &self,
        path: &Path,
        remote: &str,
        branch: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        credentials.credential()?;

        let mut state = self.state();
        let url = state
            .mirrors
            .get(path)
            .and_then(|mirror| mirror.remotes.get(remote).cloned())
            .ok_or_else(|| anyhow!("no remote {}", remote))?;
        state
            .destinations
            .get_mut(&url)
            .and_then(|branches| branches.remove(branch))
            .map(|_| ())
            .ok_or_else(|| anyhow!("no branch {} on {}", branch, url))
    }

    async fn remotes(&self, path: &Path) -> Result<Vec<String>> {
        let state = self.state();
        let mirror = state
            .mirrors
            .get(path)
            .ok_or_else(|| anyhow!("{} is not a repository", path.display()))?;
        Ok(mirror.remotes.keys().cloned().collect())
    }

    async fn remove_remote(&self, path: &Path, name: &str) -> Result<()> {
        let mut state = self.state();
        state
            .mirrors
            .get_mut(path)
            .and_then(|mirror| mirror.remotes.remove(name))
            .map(|_| ())
            .ok_or_else(|| anyhow!("no remote {}", name))
    }

    async fn add_remote(&self, path: &Path, name: &str, url: &str) -> Result<()> {
        let mut state = self.state();
        let mirror = state
            .mirrors
            .get_mut(path)
            .ok_or_else(|| anyhow!("{} is not a repository", path.display()))?;
        if mirror.remotes.contains_key(name) {
            return Err(anyhow!("remote {} already exists", name));
        }
        mirror.remotes.insert(name.to_string(), url.to_string());
        Ok(())
    }

    async fn push_force(
        &self,
        path: &Path,
        remote: &str,
        branch: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        credentials.credential()?;

        let mut state = self.state();
        state.push_attempts += 1;

        let repository = repository_of(path);
        if state
            .failing_pushes
            .contains(&(repository.clone(), branch.to_string()))
        {
            return Err(anyhow!("remote rejected {}", branch));
        }

        let mirror = state
            .mirrors
            .get(path)
            .ok_or_else(|| anyhow!("{} is not a repository", path.display()))?;
        let url = mirror
            .remotes
            .get(remote)
            .cloned()
            .ok_or_else(|| anyhow!("no remote {}", remote))?;
        let commit = mirror
            .local
            .get(branch)
            .cloned()
            .ok_or_else(|| anyhow!("no local branch {}", branch))?;

        let destination = state.destinations.entry(url).or_default();
        if let Some(blocking) = destination
            .keys()
            .find(|name| branches_conflict(name, branch))
        {
            return Err(anyhow!("cannot lock {}: {} exists", branch, blocking));
        }
        destination.insert(branch.to_string(), commit.clone());
        state.pushes.push(PushRecord {
            repository,
            branch: branch.to_string(),
            commit,
        });
        Ok(())
    }
}

/// Lister over a fixed, editable set of repositories
#[derive(Default)]
pub struct FakeLister {
    repositories: Mutex<Vec<SourceRepository>>,
    fail: AtomicBool,
}

impl FakeLister {
    pub fn add(&self, name: &str) {
        self.repositories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SourceRepository {
                name: name.to_string(),
                clone_url: source_url(name),
                last_updated: None,
            });
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RepositoryLister for FakeLister {
    async fn list_repositories(&self) -> Result<Vec<SourceRepository>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("401 Unauthorized"));
        }
        Ok(self
            .repositories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn provider_name(&self) -> &'static str {
        "fake source"
    }
}

/// Provisioner that remembers what it created
#[derive(Default)]
pub struct FakeProvisioner {
    existing: Mutex<HashSet<String>>,
    created: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeProvisioner {
    pub fn fail_for(&self, name: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }

    pub fn created(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl RemoteProvisioner for FakeProvisioner {
    async fn repository_exists(&self, name: &str) -> Result<bool> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
        {
            return Err(anyhow!("403 Forbidden for {}", name));
        }
        Ok(self
            .existing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name))
    }

    async fn create_repository(&self, name: &str) -> Result<()> {
        self.existing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name.to_string());
        Ok(())
    }

    fn remote_url(&self, name: &str) -> String {
        destination_url(name)
    }
}

/// Engine wired to fakes, with history and mirrors in a temp directory
///
/// Every `run` builds a fresh engine and history service, like a separate
/// process invocation sharing the same files.
pub struct Harness {
    pub dir: TempDir,
    pub vcs: Arc<FakeVcs>,
    pub lister: Arc<FakeLister>,
    pub provisioner: Arc<FakeProvisioner>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
            vcs: Arc::new(FakeVcs::new()),
            lister: Arc::new(FakeLister::default()),
            provisioner: Arc::new(FakeProvisioner::default()),
        }
    }

    /// Add a repository to both the listing and the fake source
    pub fn add_repository(&self, name: &str, branches: &[(&str, &str)]) {
        self.vcs.set_source(name, branches);
        self.lister.add(name);
    }

    pub fn working_dir(&self) -> PathBuf {
        self.dir.path().join("repos")
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.path().join("state").join("sync_history.json")
    }

    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            working_dir: self.working_dir(),
            remote_name: "mirror".to_string(),
            worker_count: 4,
            repository_timeout: None,
            detection_policy: DetectionErrorPolicy::AssumeChanged,
            exclusions: ExclusionFilter::default(),
        }
    }

    pub async fn try_run_with(&self, options: EngineOptions) -> Result<SyncSummary> {
        let history = HistoryService::spawn(SyncHistoryStore::load(self.history_path()));
        let engine = SyncEngine::new(
            options,
            self.vcs.clone(),
            self.lister.clone(),
            self.provisioner.clone(),
            history.clone(),
            credentials(),
            credentials(),
        );

        let result = engine.run_once().await;
        drop(engine);
        history.shutdown().await?;
        result
    }

    pub async fn run_with(&self, options: EngineOptions) -> SyncSummary {
        self.try_run_with(options).await.expect("sync pass failed")
    }

    pub async fn run(&self) -> SyncSummary {
        self.run_with(self.options()).await
    }

    /// History as persisted on disk
    pub fn history(&self) -> SyncRecord {
        SyncHistoryStore::load(self.history_path()).into_record()
    }
}
