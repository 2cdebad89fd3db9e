//! Azure DevOps Repos provisioning

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::credentials::CredentialProvider;
use crate::discovery::RemoteProvisioner;

pub const DEFAULT_API_URL: &str = "https://dev.azure.com";

const API_VERSION: &str = "7.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RepositoryList {
    #[serde(default)]
    value: Vec<RepositoryItem>,
}

#[derive(Debug, Deserialize)]
struct RepositoryItem {
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateRepositoryRequest<'a> {
    name: &'a str,
    project: ProjectReference<'a>,
}

#[derive(Debug, Serialize)]
struct ProjectReference<'a> {
    id: &'a str,
}

/// Creates repositories in one Azure DevOps project
pub struct AzureDevOpsClient {
    client: Client,
    api_url: Url,
    organization: String,
    project_id: String,
    project_name: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl AzureDevOpsClient {
    pub fn new(
        api_url: &str,
        organization: impl Into<String>,
        project_id: impl Into<String>,
        project_name: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let api_url = Url::parse(api_url)
            .with_context(|| format!("Invalid Azure DevOps URL: {}", api_url))?;
        if api_url.cannot_be_a_base() {
            return Err(anyhow!("Azure DevOps URL cannot be a base: {}", api_url));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url,
            organization: organization.into(),
            project_id: project_id.into(),
            project_name: project_name.into(),
            credentials,
        })
    }

    fn url_with_segments(&self, segments: &[&str]) -> Url {
        let mut url = self.api_url.clone();
        // cannot_be_a_base was rejected in new()
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn repositories_url(&self) -> Url {
        let mut url = self.url_with_segments(&[
            &self.organization,
            &self.project_id,
            "_apis",
            "git",
            "repositories",
        ]);
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        url
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let credential = self
            .credentials
            .credential()
            .context("Failed to resolve Azure DevOps credentials")?;
        Ok(request.basic_auth(&credential.username, Some(credential.token.expose())))
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let url = self.repositories_url();
        debug!("Listing Azure DevOps repositories at {}", url);

        let response = self
            .authorized(self.client.get(url.clone()))?
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Azure DevOps returned {} listing repositories: {}",
                status,
                body.trim()
            ));
        }

        let list: RepositoryList = response
            .json()
            .await
            .context("Failed to parse Azure DevOps repository list")?;
        Ok(list.value.into_iter().map(|item| item.name).collect())
    }
}

#[async_trait]
impl RemoteProvisioner for AzureDevOpsClient {
    async fn repository_exists(&self, name: &str) -> Result<bool> {
        let names = self.list_names().await?;
        Ok(names.iter().any(|existing| existing.eq_ignore_ascii_case(name)))
    }

    async fn create_repository(&self, name: &str) -> Result<()> {
        let url = self.repositories_url();
        let body = CreateRepositoryRequest {
            name,
            project: ProjectReference {
                id: &self.project_id,
            },
        };

        let response = self
            .authorized(self.client.post(url.clone()).json(&body))?
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Azure DevOps returned {} creating {}: {}",
                status,
                name,
                body.trim()
            ));
        }

        Ok(())
    }

    fn remote_url(&self, name: &str) -> String {
        self.url_with_segments(&[&self.organization, &self.project_name, "_git", name])
            .to_string()
    }
}
