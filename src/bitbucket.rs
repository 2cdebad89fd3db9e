//! Bitbucket Cloud repository listing

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::credentials::CredentialProvider;
use crate::discovery::{strip_userinfo, RepositoryLister, SourceRepository};

pub const DEFAULT_API_URL: &str = "https://api.bitbucket.org/2.0";

const PAGE_LENGTH: &str = "100";
const MAX_PAGES: usize = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RepositoryPage {
    #[serde(default)]
    values: Vec<RepositoryEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    name: String,
    #[serde(default)]
    links: RepositoryLinks,
    updated_on: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RepositoryLinks {
    #[serde(default)]
    clone: Vec<CloneLink>,
}

#[derive(Debug, Deserialize)]
struct CloneLink {
    href: String,
    name: String,
}

impl RepositoryEntry {
    fn into_source(self) -> Option<SourceRepository> {
        // Prefer the https link; git needs it for header-based auth
        let link = self
            .links
            .clone
            .iter()
            .find(|link| link.name.eq_ignore_ascii_case("https"))
            .or_else(|| self.links.clone.first());

        let Some(link) = link else {
            warn!("Repository {} has no clone link, skipping", self.name);
            return None;
        };

        let last_updated = self
            .updated_on
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc));

        Some(SourceRepository {
            clone_url: strip_userinfo(&link.href),
            name: self.name,
            last_updated,
        })
    }
}

/// Lists the repositories of one Bitbucket workspace
pub struct BitbucketClient {
    client: Client,
    api_url: Url,
    workspace: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl BitbucketClient {
    pub fn new(
        api_url: &str,
        workspace: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let api_url = Url::parse(api_url)
            .with_context(|| format!("Invalid Bitbucket API URL: {}", api_url))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url,
            workspace: workspace.into(),
            credentials,
        })
    }

    /// First page of the workspace listing, most recently updated first
    fn first_page_url(&self) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Bitbucket API URL cannot be a base: {}", self.api_url))?
            .pop_if_empty()
            .push("repositories")
            .push(&self.workspace);
        url.query_pairs_mut()
            .append_pair("sort", "-updated_on")
            .append_pair("pagelen", PAGE_LENGTH);
        Ok(url)
    }

    /// Parse a `next` link, refusing hosts other than the API's own so the
    /// credentials are never sent elsewhere
    fn next_page_url(&self, next: &str) -> Result<Url> {
        let url = Url::parse(next)
            .with_context(|| format!("Invalid Bitbucket pagination link: {}", next))?;
        if url.origin() != self.api_url.origin() {
            return Err(anyhow!(
                "Bitbucket pagination link {} leaves {}",
                url,
                self.api_url.origin().ascii_serialization()
            ));
        }
        Ok(url)
    }

    async fn fetch_page(&self, url: &Url) -> Result<RepositoryPage> {
        let credential = self
            .credentials
            .credential()
            .context("Failed to resolve Bitbucket credentials")?;

        debug!("Fetching Bitbucket page {}", url);
        let response = self
            .client
            .get(url.clone())
            .basic_auth(&credential.username, Some(credential.token.expose()))
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Bitbucket API returned {} for workspace {}: {}",
                status,
                self.workspace,
                body.trim()
            ));
        }

        response
            .json::<RepositoryPage>()
            .await
            .context("Failed to parse Bitbucket repository page")
    }
}

#[async_trait]
impl RepositoryLister for BitbucketClient {
    async fn list_repositories(&self) -> Result<Vec<SourceRepository>> {
        let mut repositories = Vec::new();
        let mut next = Some(self.first_page_url()?);
        let mut pages = 0;

        while let Some(url) = next.take() {
            let page = self.fetch_page(&url).await?;
            repositories.extend(page.values.into_iter().filter_map(RepositoryEntry::into_source));
            next = page
                .next
                .as_deref()
                .map(|link| self.next_page_url(link))
                .transpose()?;

            pages += 1;
            if pages >= MAX_PAGES && next.is_some() {
                warn!("Reached maximum pagination limit ({} pages)", MAX_PAGES);
                break;
            }
        }

        info!(
            "Found {} repositories in Bitbucket workspace {}",
            repositories.len(),
            self.workspace
        );
        Ok(repositories)
    }

    fn provider_name(&self) -> &'static str {
        "Bitbucket"
    }
}
