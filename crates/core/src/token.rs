//! Per-tenant provider token cache.
//!
//! Tokens authenticate outbound webhook calls toward the partner backend.
//! Fetches go to a primary lookup endpoint with a provision fallback; when
//! both fail, a stale cached token is preferred over failing outright.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TokenAuthorityConfig;
use crate::error::{GateError, Result};

/// Header carrying the static shared secret toward the token authority.
pub const SECRET_HEADER: &str = "x-internal-secret";

#[derive(Debug, Clone)]
struct TokenEntry {
	token: String,
	fetched_at: Instant,
}

/// Response body of both authority endpoints.
#[derive(Debug, Deserialize)]
struct TokenBody {
	provider_token: Option<String>,
	token: Option<String>,
}

impl TokenBody {
	fn into_token(self) -> Option<String> {
		self.provider_token.or(self.token).filter(|token| !token.is_empty())
	}
}

pub struct ProviderTokenCache {
	http: reqwest::Client,
	cfg: TokenAuthorityConfig,
	refresh: Duration,
	entries: Mutex<HashMap<String, TokenEntry>>,
}

impl ProviderTokenCache {
	pub fn new(http: reqwest::Client, cfg: TokenAuthorityConfig, refresh: Duration) -> Self {
		Self {
			http,
			cfg,
			refresh,
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Returns a token for `tenant`, fetching unless a cached one is still
	/// fresh. `force` bypasses the cache (used after a 401 from the webhook
	/// destination).
	pub async fn ensure(&self, tenant: &str, force: bool) -> Result<String> {
		if !force {
			let entries = self.entries.lock();
			if let Some(entry) = entries.get(tenant) {
				if entry.fetched_at.elapsed() < self.refresh {
					return Ok(entry.token.clone());
				}
			}
		}

		match self.fetch(tenant).await {
			Ok(token) => {
				self.entries.lock().insert(
					tenant.to_string(),
					TokenEntry {
						token: token.clone(),
						fetched_at: Instant::now(),
					},
				);
				Ok(token)
			}
			Err(err) => {
				// Availability over freshness: a stale token usually still works.
				if let Some(entry) = self.entries.lock().get(tenant) {
					warn!(target = "gate.token", tenant, error = %err, "token fetch failed; serving cached value");
					return Ok(entry.token.clone());
				}
				warn!(target = "gate.token", tenant, error = %err, "token fetch failed with empty cache");
				Err(GateError::TokenUnavailable(tenant.to_string()))
			}
		}
	}

	async fn fetch(&self, tenant: &str) -> Result<String> {
		let base = self.cfg.base_url.trim_end_matches('/');
		let primary = format!("{base}/admin/provider-token/{tenant}");
		let response = self
			.http
			.get(&primary)
			.header(SECRET_HEADER, &self.cfg.shared_secret)
			.send()
			.await?;

		let status = response.status();
		if status.is_success() {
			return parse_token(response).await;
		}
		if status == StatusCode::NOT_FOUND || status == StatusCode::UNAUTHORIZED {
			debug!(target = "gate.token", tenant, %status, "primary lookup missed; provisioning");
			return self.provision(tenant).await;
		}
		Err(GateError::Transient(format!("token authority returned {status}")))
	}

	async fn provision(&self, tenant: &str) -> Result<String> {
		let base = self.cfg.base_url.trim_end_matches('/');
		let url = format!("{base}/internal/tenant/{tenant}/ensure");
		let response = self.http.post(&url).header(SECRET_HEADER, &self.cfg.shared_secret).send().await?;
		let status = response.status();
		if status.is_success() {
			return parse_token(response).await;
		}
		Err(GateError::Transient(format!("token provisioning returned {status}")))
	}

	/// Tenants with a cached token.
	pub fn known_tenants(&self) -> Vec<String> {
		self.entries.lock().keys().cloned().collect()
	}
}

async fn parse_token(response: reqwest::Response) -> Result<String> {
	let body: TokenBody = response.json().await?;
	body.into_token()
		.ok_or_else(|| GateError::Transient("token missing from authority response".to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_body_accepts_both_field_names() {
		let provider: TokenBody = serde_json::from_str(r#"{"provider_token":"a"}"#).unwrap();
		assert_eq!(provider.into_token().as_deref(), Some("a"));

		let plain: TokenBody = serde_json::from_str(r#"{"token":"b"}"#).unwrap();
		assert_eq!(plain.into_token().as_deref(), Some("b"));

		let both: TokenBody = serde_json::from_str(r#"{"provider_token":"a","token":"b"}"#).unwrap();
		assert_eq!(both.into_token().as_deref(), Some("a"));

		let empty: TokenBody = serde_json::from_str(r#"{"token":""}"#).unwrap();
		assert!(empty.into_token().is_none());
	}
}
