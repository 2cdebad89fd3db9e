//! Repository discovery abstraction layer
//!
//! This module defines the repository model the engine works on and the two
//! platform capabilities it needs: listing repositories on the source
//! ([`RepositoryLister`]) and provisioning them on the destination
//! ([`RemoteProvisioner`]).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info};
use url::Url;

/// A repository as reported by the source platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRepository {
    pub name: String,
    /// Clone URL without credentials
    pub clone_url: String,
    pub last_updated: Option<DateTime<Utc>>,
}

/// One repository to mirror for the duration of a run
///
/// Identity is the name; it names the local mirror directory and the
/// destination repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub source_clone_url: String,
    pub destination_url: String,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn new(source: SourceRepository, destination_url: impl Into<String>) -> Self {
        Self {
            name: source.name,
            source_clone_url: source.clone_url,
            destination_url: destination_url.into(),
            last_updated: source.last_updated,
        }
    }
}

/// Lists the repositories to mirror from the source platform
#[async_trait]
pub trait RepositoryLister: Send + Sync {
    async fn list_repositories(&self) -> Result<Vec<SourceRepository>>;

    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;
}

/// Creates repositories on the destination platform
#[async_trait]
pub trait RemoteProvisioner: Send + Sync {
    async fn repository_exists(&self, name: &str) -> Result<bool>;

    async fn create_repository(&self, name: &str) -> Result<()>;

    /// Git URL of the destination repository, without credentials
    fn remote_url(&self, name: &str) -> String;

    /// Create `name` unless it already exists
    async fn ensure_repository(&self, name: &str) -> Result<()> {
        if self.repository_exists(name).await? {
            debug!("{} already exists on the destination", name);
            return Ok(());
        }

        self.create_repository(name)
            .await
            .with_context(|| format!("Failed to create destination repository {}", name))?;
        info!("{} created on the destination", name);
        Ok(())
    }
}

/// Glob-style repository exclusion (`archived-*`, `*.github.io`, exact names)
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<Regex>,
}

impl ExclusionFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let expr = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
                Regex::new(&expr)
                    .with_context(|| format!("Invalid exclusion pattern: {}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

/// Drop any `user:password@` part from a clone URL
///
/// Strings that do not parse as URLs (scp-style `git@host:path`) are
/// returned unchanged.
pub fn strip_userinfo(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.has_host() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

/// List the source, drop excluded repositories and attach destination URLs
pub async fn discover(
    lister: &dyn RepositoryLister,
    provisioner: &dyn RemoteProvisioner,
    filter: &ExclusionFilter,
) -> Result<Vec<Repository>> {
    let listed = lister
        .list_repositories()
        .await
        .with_context(|| format!("Failed to list repositories from {}", lister.provider_name()))?;

    let total = listed.len();
    let repositories: Vec<Repository> = listed
        .into_iter()
        .filter(|source| {
            let excluded = filter.is_excluded(&source.name);
            if excluded {
                debug!("Excluding repository due to pattern match: {}", source.name);
            }
            !excluded
        })
        .map(|source| {
            let destination = provisioner.remote_url(&source.name);
            Repository::new(source, destination)
        })
        .collect();

    info!(
        "Discovered {} repositories from {} ({} after exclusions)",
        total,
        lister.provider_name(),
        repositories.len()
    );

    Ok(repositories)
}
