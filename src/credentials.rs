//! Credential providers for the source and destination platforms
//!
//! Secrets are resolved at the point of each REST or git call through a
//! [`CredentialProvider`]. They are never folded into a remote URL, so nothing
//! long-lived (git config, logs, process arguments) carries a token.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::env;
use std::fmt;

/// An access token whose value never shows up in `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw token. Only call this right where it is sent.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Username and token pair used for HTTP basic authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Empty for token-only platforms such as Azure DevOps
    pub username: String,
    pub token: Secret,
}

impl Credential {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: Secret::new(token),
        }
    }

    /// A credential with an empty username (PAT-only authentication)
    pub fn token_only(token: impl Into<String>) -> Self {
        Self::new(String::new(), token)
    }

    /// Value for an `Authorization` header
    pub fn basic_auth_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.token.expose());
        format!("Basic {}", STANDARD.encode(raw))
    }
}

/// Source of credentials, consulted on every network or git operation
#[cfg_attr(test, mockall::automock)]
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Result<Credential>;
}

/// Reads the token from an environment variable each time it is requested
///
/// The username is not secret and comes from configuration.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    username: String,
    token_var: String,
}

impl EnvTokenProvider {
    pub fn new(username: impl Into<String>, token_var: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token_var: token_var.into(),
        }
    }

    pub fn token_only(token_var: impl Into<String>) -> Self {
        Self::new(String::new(), token_var)
    }

    pub fn token_var(&self) -> &str {
        &self.token_var
    }
}

impl CredentialProvider for EnvTokenProvider {
    fn credential(&self) -> Result<Credential> {
        let token = env::var(&self.token_var)
            .with_context(|| format!("{} environment variable not set", self.token_var))?;

        if token.trim().is_empty() {
            return Err(anyhow!("{} is empty", self.token_var));
        }

        Ok(Credential::new(self.username.clone(), token.trim()))
    }
}

/// Fixed credential, for tests and local file remotes
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credential);

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self) -> Result<Credential> {
        Ok(self.0.clone())
    }
}
