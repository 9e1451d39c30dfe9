//! The object service client.
//!
//! Three endpoints, all rooted at the repo origin's `/gvfs` prefix (or the
//! configured cache server for object traffic): `GET /gvfs/config`,
//! `GET /gvfs/objects/{oid}` for one deflated loose object, and
//! `POST /gvfs/objects` for a packfile covering a batch. Every request runs
//! through the same retry loop: exponential backoff with jitter on transient
//! failures, one credential refresh on 401, and a trace event per attempt.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::{StatusCode, header::AUTHORIZATION};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    errors::{ErrorClass, GvfsError},
    http::auth::CredentialManager,
    oid::ObjectId,
};

const INITIAL_DELAY_MS: u64 = 200;
const BACKOFF_FACTOR: f64 = 2.0;
const MAX_REDIRECTS: usize = 5;

/// Exponential backoff with 0.9–1.1 jitter so synchronized retries spread out.
pub fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    let base = (INITIAL_DELAY_MS as f64 * exp) as u64;
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Request tuning carried over from the mount config.
#[derive(Debug, Clone)]
pub struct RequesterOptions {
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for RequesterOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    commits: Vec<String>,
    allow_pack_files: bool,
}

/// HTTP client for the object service.
#[derive(Debug)]
pub struct ObjectRequester {
    client: reqwest::Client,
    /// Origin `/gvfs` base; also the credential scope.
    base_url: String,
    /// Preferred for object traffic when configured.
    cache_server_url: Option<String>,
    credentials: Arc<CredentialManager>,
    options: RequesterOptions,
}

impl ObjectRequester {
    /// Build the client. TLS is mandatory; plain http is tolerated only for
    /// loopback hosts so functional tests can run against a local stub.
    pub fn new(
        base_url: String,
        cache_server_url: Option<String>,
        credentials: Arc<CredentialManager>,
        options: RequesterOptions,
    ) -> Result<ObjectRequester, GvfsError> {
        for url in std::iter::once(&base_url).chain(cache_server_url.iter()) {
            validate_url(url)?;
        }
        let client = reqwest::Client::builder()
            .user_agent(format!("GVFS/{}", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| GvfsError::NetworkError(e.to_string()))?;
        Ok(ObjectRequester {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache_server_url: cache_server_url.map(|u| u.trim_end_matches('/').to_string()),
            credentials,
            options,
        })
    }

    fn object_base(&self) -> &str {
        self.cache_server_url.as_deref().unwrap_or(&self.base_url)
    }

    /// `GET /gvfs/config`: supported client versions and cache servers.
    pub async fn get_server_config(&self) -> Result<ServerConfig, GvfsError> {
        let url = format!("{}/gvfs/config", self.base_url);
        let bytes = self
            .execute("config", || self.client.get(&url))
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GvfsError::CustomError(format!("malformed server config: {e}")))
    }

    /// `GET /gvfs/objects/{oid}`: the zlib-deflated loose form of one object.
    pub async fn get_object(&self, oid: &ObjectId) -> Result<Bytes, GvfsError> {
        let url = format!("{}/gvfs/objects/{oid}", self.object_base());
        self.execute("object", || self.client.get(&url)).await
    }

    /// `POST /gvfs/objects`: a packfile covering `oids` (and for commit ids,
    /// their trees). The returned stream goes straight to the store's pack
    /// installer.
    pub async fn post_batch(
        &self,
        oids: &[ObjectId],
        allow_pack_files: bool,
    ) -> Result<Bytes, GvfsError> {
        let url = format!("{}/gvfs/objects", self.object_base());
        let body = BatchRequest {
            commits: oids.iter().map(ObjectId::to_string).collect(),
            allow_pack_files,
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| GvfsError::CustomError(format!("batch encode: {e}")))?;
        self.execute("batch", move || {
            self.client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.clone())
        })
        .await
    }

    /// The shared retry loop. `make` builds a fresh request per attempt; the
    /// error taxonomy decides what happens to a failed one: `Auth` gets one
    /// credential refresh, retryable classes back off, everything else
    /// surfaces immediately.
    async fn execute<F>(&self, area: &str, make: F) -> Result<Bytes, GvfsError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut refreshed = false;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = std::time::Instant::now();
            let credential = self.credentials.get(&self.base_url).await?;
            let sent = make()
                .header(AUTHORIZATION, credential.basic_header())
                .timeout(self.options.timeout)
                .send()
                .await;

            let outcome = match sent {
                Ok(response) if response.status().is_success() => {
                    collect_body(response).await
                }
                Ok(response) => Err(error_for_status(area, response.status())),
                Err(e) => Err(GvfsError::NetworkError(e.to_string())),
            };

            let error = match outcome {
                Ok(bytes) => {
                    info!(
                        area,
                        attempt,
                        bytes = bytes.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "request succeeded"
                    );
                    return Ok(bytes);
                }
                Err(error) => {
                    info!(
                        area,
                        attempt,
                        class = ?error.class(),
                        error = %error,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "request attempt failed"
                    );
                    error
                }
            };

            match error.class() {
                ErrorClass::Auth if !refreshed => {
                    warn!(area, "object service rejected credentials; refreshing");
                    self.credentials.revoke(&self.base_url).await;
                    refreshed = true;
                }
                // One refresh per original request; a second rejection is a
                // hard auth failure.
                ErrorClass::Auth => return Err(error),
                _ if error.is_retryable() && attempt < self.options.max_attempts => {
                    tokio::time::sleep(backoff(attempt)).await;
                }
                _ => return Err(error),
            }
        }
    }
}

/// Map a non-success HTTP status to the error class that drives the retry
/// loop.
fn error_for_status(area: &str, status: StatusCode) -> GvfsError {
    if status == StatusCode::UNAUTHORIZED {
        GvfsError::Unauthorized(format!("object service answered {status}"))
    } else if status == StatusCode::NOT_FOUND {
        GvfsError::ObjectNotFound(format!("{area} endpoint"))
    } else if status.is_server_error() {
        GvfsError::ServerError(status.as_u16())
    } else {
        GvfsError::CustomError(format!("unexpected HTTP status {status}"))
    }
}

/// Drain a success response; a stream torn mid-body comes back as a
/// retryable network error.
async fn collect_body(response: reqwest::Response) -> Result<Bytes, GvfsError> {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GvfsError::NetworkError(e.to_string()))?;
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

fn validate_url(url: &str) -> Result<(), GvfsError> {
    if url.starts_with("https://") {
        return Ok(());
    }
    let loopback = url.starts_with("http://127.0.0.1")
        || url.starts_with("http://localhost")
        || url.starts_with("http://[::1]");
    if loopback {
        return Ok(());
    }
    Err(GvfsError::InvalidRequest(format!(
        "object service URL must use https: {url}"
    )))
}
