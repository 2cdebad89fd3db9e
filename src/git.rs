use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::credentials::CredentialProvider;

/// Remote name of the source platform inside every local mirror
pub const SOURCE_REMOTE: &str = "origin";

/// Symbolic ref every remote exposes for its default branch
const HEAD_REF: &str = "HEAD";

/// A branch on the source remote and the commit it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub name: String,
    pub tip: String,
}

/// Version-control primitives the sync engine is built on
///
/// Operations that reach the network take the credential provider for the
/// platform they talk to; it is consulted on every call.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Whether `path` holds a usable working copy
    async fn is_repository(&self, path: &Path) -> bool;

    async fn clone_repo(
        &self,
        url: &str,
        path: &Path,
        credentials: &dyn CredentialProvider,
    ) -> Result<()>;

    /// Fetch all references of `remote`, pruning deleted branches
    async fn fetch(
        &self,
        path: &Path,
        remote: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()>;

    /// Remote-tracking branches of `remote`, without the `HEAD` pointer
    async fn remote_branches(&self, path: &Path, remote: &str) -> Result<Vec<BranchRef>>;

    /// Check out `branch`, (re)creating it to track `remote/branch`
    async fn checkout_tracking(&self, path: &Path, remote: &str, branch: &str) -> Result<()>;

    /// Commit the local branch points at
    async fn branch_tip(&self, path: &Path, branch: &str) -> Result<String>;

    /// Names of the local branches
    async fn local_branches(&self, path: &Path) -> Result<Vec<String>>;

    /// Delete a local branch, detaching `HEAD` first if it is checked out
    async fn delete_branch(&self, path: &Path, branch: &str) -> Result<()>;

    /// Delete `branch` on `remote`
    async fn delete_remote_branch(
        &self,
        path: &Path,
        remote: &str,
        branch: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()>;

    async fn remotes(&self, path: &Path) -> Result<Vec<String>>;

    async fn remove_remote(&self, path: &Path, name: &str) -> Result<()>;

    async fn add_remote(&self, path: &Path, name: &str, url: &str) -> Result<()>;

    /// Overwrite `remote`'s branch with the local branch of the same name
    async fn push_force(
        &self,
        path: &Path,
        remote: &str,
        branch: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()>;
}

/// [`VersionControl`] backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: OsString,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: OsString::from("git"),
        }
    }

    /// Use a specific git binary
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run git and return stdout, failing on a non-zero exit status
    async fn run<I, S>(
        &self,
        dir: Option<&Path>,
        args: I,
        credentials: Option<&dyn CredentialProvider>,
    ) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();
        let operation = args
            .first()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut command = AsyncCommand::new(&self.program);
        command
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        if let Some(provider) = credentials {
            for (key, value) in auth_env(provider)? {
                command.env(key, value);
            }
        }

        debug!("Running git {}", operation);

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", operation))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Git {} failed: {}", operation, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn is_repository(&self, path: &Path) -> bool {
        let has_git_dir = tokio::fs::metadata(path.join(".git"))
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        // The .git check keeps a plain directory nested inside some other
        // checkout from being mistaken for a mirror.
        has_git_dir
            && self
                .run(Some(path), ["rev-parse", "--git-dir"], None)
                .await
                .is_ok()
    }

    async fn clone_repo(
        &self,
        url: &str,
        path: &Path,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        let args: [&OsStr; 4] = [
            OsStr::new("clone"),
            OsStr::new("--"),
            OsStr::new(url),
            path.as_os_str(),
        ];
        self.run(None, args, Some(credentials)).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        path: &Path,
        remote: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        self.run(Some(path), ["fetch", "--prune", remote], Some(credentials))
            .await?;
        Ok(())
    }

    async fn remote_branches(&self, path: &Path, remote: &str) -> Result<Vec<BranchRef>> {
        let prefix = format!("refs/remotes/{}/", remote);
        let output = self
            .run(
                Some(path),
                [
                    "for-each-ref",
                    "--format=%(refname)%09%(objectname)",
                    prefix.as_str(),
                ],
                None,
            )
            .await?;

        Ok(parse_remote_branches(&output, remote))
    }

    async fn checkout_tracking(&self, path: &Path, remote: &str, branch: &str) -> Result<()> {
        let upstream = format!("{}/{}", remote, branch);
        self.run(
            Some(path),
            ["checkout", "--force", "-B", branch, "--track", upstream.as_str()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn branch_tip(&self, path: &Path, branch: &str) -> Result<String> {
        let rev = format!("refs/heads/{}^{{commit}}", branch);
        let output = self
            .run(Some(path), ["rev-parse", "--verify", rev.as_str()], None)
            .await?;

        let commit = output.trim();
        if commit.is_empty() {
            return Err(anyhow!("Git rev-parse returned no commit for {}", branch));
        }
        Ok(commit.to_string())
    }

    async fn local_branches(&self, path: &Path) -> Result<Vec<String>> {
        let output = self
            .run(
                Some(path),
                ["for-each-ref", "--format=%(refname)", "refs/heads/"],
                None,
            )
            .await?;

        Ok(output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("refs/heads/"))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn delete_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let head = format!("refs/heads/{}", branch);
        // Fails when HEAD is already detached
        let checked_out = self
            .run(Some(path), ["symbolic-ref", "--quiet", "HEAD"], None)
            .await
            .map(|current| current.trim() == head)
            .unwrap_or(false);

        if checked_out {
            self.run(Some(path), ["checkout", "--quiet", "--force", "--detach"], None)
                .await?;
        }

        self.run(Some(path), ["branch", "-D", branch], None).await?;
        Ok(())
    }

    async fn delete_remote_branch(
        &self,
        path: &Path,
        remote: &str,
        branch: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        let head = format!("refs/heads/{}", branch);
        self.run(
            Some(path),
            ["push", "--delete", remote, head.as_str()],
            Some(credentials),
        )
        .await?;
        Ok(())
    }

    async fn remotes(&self, path: &Path) -> Result<Vec<String>> {
        let output = self.run(Some(path), ["remote"], None).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove_remote(&self, path: &Path, name: &str) -> Result<()> {
        self.run(Some(path), ["remote", "remove", name], None).await?;
        Ok(())
    }

    async fn add_remote(&self, path: &Path, name: &str, url: &str) -> Result<()> {
        self.run(Some(path), ["remote", "add", name, url], None)
            .await?;
        Ok(())
    }

    async fn push_force(
        &self,
        path: &Path,
        remote: &str,
        branch: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<()> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.run(
            Some(path),
            ["push", "--force", remote, refspec.as_str()],
            Some(credentials),
        )
        .await?;
        Ok(())
    }
}

/// Environment that hands git an `Authorization` header for this one
/// invocation, keeping the token out of argv and out of `.git/config`
pub(crate) fn auth_env(provider: &dyn CredentialProvider) -> Result<Vec<(&'static str, String)>> {
    let credential = provider
        .credential()
        .context("Failed to resolve git credentials")?;

    Ok(vec![
        ("GIT_CONFIG_COUNT", "1".to_string()),
        ("GIT_CONFIG_KEY_0", "http.extraHeader".to_string()),
        (
            "GIT_CONFIG_VALUE_0",
            format!("Authorization: {}", credential.basic_auth_header()),
        ),
    ])
}

/// Whether two branch names cannot exist side by side, as in `feature` and
/// `feature/x`
pub fn branches_conflict(a: &str, b: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with('/'))
    };
    nested(a, b) || nested(b, a)
}

/// Parse `for-each-ref` output of `<refname>\t<objectname>` lines
fn parse_remote_branches(output: &str, remote: &str) -> Vec<BranchRef> {
    let prefix = format!("refs/remotes/{}/", remote);

    output
        .lines()
        .filter_map(|line| {
            let (refname, tip) = line.split_once('\t')?;
            let name = refname.trim().strip_prefix(&prefix)?;
            if name.is_empty() || name == HEAD_REF {
                return None;
            }
            Some(BranchRef {
                name: name.to_string(),
                tip: tip.trim().to_string(),
            })
        })
        .collect()
}
