//! Credentials for the object service.
//!
//! The core never prompts: it asks the external credential helper through
//! `git credential fill`, caches the answer per repo URL, and revokes through
//! `git credential reject` when the service answers 401. The helper seam is a
//! trait so tests can inject a scripted source.

use std::{collections::HashMap, path::PathBuf, sync::Mutex};

use async_trait::async_trait;
use base64::Engine;
use tracing::{debug, warn};

use crate::{errors::GvfsError, gitproc::GitCommand};

/// One username/password pair for a repo URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// `Authorization: Basic …` header value.
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// Where credentials come from. Production uses [`GitCredentialHelper`];
/// tests script their own.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fill(&self, url: &str) -> Result<Credential, GvfsError>;
    async fn reject(&self, url: &str, credential: &Credential) -> Result<(), GvfsError>;
}

/// The shipped git binary's credential subsystem.
pub struct GitCredentialHelper {
    git_binary: PathBuf,
}

impl GitCredentialHelper {
    pub fn new(git_binary: PathBuf) -> Self {
        Self { git_binary }
    }

    fn describe(url: &str) -> Vec<u8> {
        format!("url={url}\n\n").into_bytes()
    }
}

#[async_trait]
impl CredentialSource for GitCredentialHelper {
    async fn fill(&self, url: &str) -> Result<Credential, GvfsError> {
        let output = GitCommand::new(&self.git_binary, "fill credentials")
            .arg("credential")
            .arg("fill")
            .stdin_bytes(Self::describe(url))
            .output()
            .await
            .map_err(|e| GvfsError::CredentialHelper(e.to_string()))?;

        let mut username = None;
        let mut password = None;
        for line in output.stdout_str().lines() {
            if let Some(value) = line.strip_prefix("username=") {
                username = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("password=") {
                password = Some(value.to_string());
            }
        }
        match (username, password) {
            (Some(username), Some(password)) => Ok(Credential { username, password }),
            _ => Err(GvfsError::CredentialHelper(
                "helper produced no username/password".into(),
            )),
        }
    }

    async fn reject(&self, url: &str, credential: &Credential) -> Result<(), GvfsError> {
        let body = format!(
            "url={url}\nusername={}\npassword={}\n\n",
            credential.username, credential.password
        );
        GitCommand::new(&self.git_binary, "reject credentials")
            .arg("credential")
            .arg("reject")
            .stdin_bytes(body.into_bytes())
            .output()
            .await
            .map_err(|e| GvfsError::CredentialHelper(e.to_string()))?;
        Ok(())
    }
}

/// Per-URL credential cache over a [`CredentialSource`].
pub struct CredentialManager {
    source: Box<dyn CredentialSource>,
    cache: Mutex<HashMap<String, Credential>>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(source: Box<dyn CredentialSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached credential for `url`, filling through the helper on a miss.
    pub async fn get(&self, url: &str) -> Result<Credential, GvfsError> {
        if let Some(found) = self
            .cache
            .lock()
            .expect("credential cache lock poisoned")
            .get(url)
            .cloned()
        {
            return Ok(found);
        }
        debug!(url, "filling credentials through helper");
        let credential = self.source.fill(url).await?;
        self.cache
            .lock()
            .expect("credential cache lock poisoned")
            .insert(url.to_string(), credential.clone());
        Ok(credential)
    }

    /// Drop the cached credential and tell the helper it was rejected. The
    /// next [`CredentialManager::get`] re-fills.
    pub async fn revoke(&self, url: &str) {
        let removed = self
            .cache
            .lock()
            .expect("credential cache lock poisoned")
            .remove(url);
        if let Some(credential) = removed {
            if let Err(e) = self.source.reject(url, &credential).await {
                warn!(url, error = %e, "credential reject failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingSource {
        fills: AtomicU32,
        rejects: AtomicU32,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn fill(&self, _url: &str) -> Result<Credential, GvfsError> {
            let n = self.fills.fetch_add(1, Ordering::SeqCst);
            Ok(Credential {
                username: "user".into(),
                password: format!("secret-{n}"),
            })
        }

        async fn reject(&self, _url: &str, _credential: &Credential) -> Result<(), GvfsError> {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// The basic header matches the RFC 7617 form.
    #[test]
    fn test_basic_header() {
        let credential = Credential {
            username: "user".into(),
            password: "pass".into(),
        };
        // base64("user:pass")
        assert_eq!(credential.basic_header(), "Basic dXNlcjpwYXNz");
    }

    /// get() fills once and caches; revoke() forces a re-fill.
    #[tokio::test]
    async fn test_cache_and_revoke() {
        let manager = CredentialManager::new(Box::new(CountingSource {
            fills: AtomicU32::new(0),
            rejects: AtomicU32::new(0),
        }));
        let url = "https://example.com/repo";

        let first = manager.get(url).await.unwrap();
        let second = manager.get(url).await.unwrap();
        assert_eq!(first, second);

        manager.revoke(url).await;
        let third = manager.get(url).await.unwrap();
        assert_ne!(first.password, third.password);
    }

    /// Revoking an uncached URL never calls the helper.
    #[tokio::test]
    async fn test_revoke_uncached() {
        let source = Box::new(CountingSource {
            fills: AtomicU32::new(0),
            rejects: AtomicU32::new(0),
        });
        let manager = CredentialManager::new(source);
        manager.revoke("https://never-filled.example.com").await;
        // No panic, nothing to assert beyond the call completing.
    }
}
