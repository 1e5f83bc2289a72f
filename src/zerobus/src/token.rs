// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! OAuth2 client-credentials token acquisition and caching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Token acquisition failures, split by how they recover.
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    /// The endpoint rejected the client credentials. Not retried; needs
    /// operator intervention.
    #[error("authentication rejected by the token endpoint")]
    AuthRejected,
    /// A transport-level failure talking to the endpoint.
    #[error("token endpoint unreachable: {0}")]
    EndpointUnreachable(String),
    /// Any other network or HTTP failure.
    #[error("token endpoint error: {0}")]
    Network(String),
}

impl TokenError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TokenError::AuthRejected)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// A per-workspace-host token provider.
///
/// Caches the bearer token with its expiry and refreshes once less than the
/// refresh-ahead window (60 s) remains. The cache mutex doubles as the
/// single-flight latch: under concurrent demand with an expired token,
/// exactly one caller performs the network refresh and the rest observe the
/// refreshed cache. This is the one lock in the gateway deliberately held
/// across a suspension point.
pub struct TokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    refresh_ahead: Duration,
    cache: Mutex<Option<CachedToken>>,
    refreshes: AtomicU64,
}

impl TokenProvider {
    /// Creates a provider for `workspace_host`. `plaintext` switches the
    /// endpoint scheme to `http` for loopback tests.
    pub fn new(
        workspace_host: &str,
        client_id: &str,
        proxy: Option<&str>,
        plaintext: bool,
    ) -> Result<TokenProvider, TokenError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy).map_err(|e| TokenError::Network(e.to_string()))?,
            );
        }
        // With no explicit proxy, reqwest picks up HTTPS_PROXY/HTTP_PROXY
        // from the environment on its own.
        let client = builder
            .build()
            .map_err(|e| TokenError::Network(e.to_string()))?;
        let scheme = if plaintext { "http" } else { "https" };
        Ok(TokenProvider {
            client,
            token_url: format!("{}://{}/oidc/v1/token", scheme, workspace_host),
            client_id: client_id.to_owned(),
            refresh_ahead: Duration::from_secs(60),
            cache: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        })
    }

    /// Returns a bearer token, refreshing if the cached one has less than
    /// the refresh-ahead window remaining.
    pub async fn token(&self, client_secret: &str) -> Result<String, TokenError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at > Instant::now() + self.refresh_ahead {
                return Ok(cached.access_token.clone());
            }
        }
        let response = self.refresh(client_secret).await?;
        let token = response.access_token.clone();
        *cache = Some(CachedToken {
            access_token: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });
        Ok(token)
    }

    /// Drops the cached token so the next call performs a refresh. Used
    /// after the data plane answers 401 with a token that looked fresh.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// How many network refreshes have been performed.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    async fn refresh(&self, client_secret: &str) -> Result<TokenResponse, TokenError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.token_url, "refreshing OAuth2 token");
        let result = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", "all-apis"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", client_secret),
            ])
            .send()
            .await;
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return Err(TokenError::EndpointUnreachable(redact(e)));
            }
            Err(e) => return Err(TokenError::Network(redact(e))),
        };
        let status = response.status();
        if status.is_success() {
            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| TokenError::Network(redact(e)))
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            warn!("token endpoint rejected client credentials");
            Err(TokenError::AuthRejected)
        } else {
            Err(TokenError::Network(format!(
                "token endpoint returned {}",
                status
            )))
        }
    }
}

/// reqwest errors can embed the request URL; strip it so credentials in
/// query strings can never reach a log line.
fn redact(e: reqwest::Error) -> String {
    e.without_url().to_string()
}
