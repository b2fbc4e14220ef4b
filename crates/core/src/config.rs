//! Orchestrator configuration and tunable thresholds.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Floor for the provider-token refresh interval.
pub const MIN_TOKEN_REFRESH: Duration = Duration::from_secs(60);

/// Settings for the session orchestration layer.
///
/// Thresholds default to the values the watchdog heuristics were tuned
/// against; deployments override them through the server's env surface.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
	/// Root for per-tenant profile dirs and the persisted QR snapshot.
	pub state_root: PathBuf,
	/// Channel tag reported in webhook payloads.
	pub channel: String,
	/// Fallback webhook destination when a tenant has no override.
	pub default_webhook_url: Option<String>,
	pub token_authority: TokenAuthorityConfig,
	pub recipient: RecipientRules,
	/// How long a session may sit idle without QR progress before a soft
	/// reinit of its client.
	pub idle_threshold: Duration,
	/// How long the "opening" connectivity state may persist before a reset.
	pub opening_timeout: Duration,
	pub watchdog_interval: Duration,
	/// Cadence of active connectivity probes against ready sessions.
	pub probe_interval: Duration,
	pub token_refresh: Duration,
	/// Socket timeout applied to all outbound HTTP calls.
	pub http_timeout: Duration,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			state_root: PathBuf::from("state"),
			channel: "whatsapp-web".to_string(),
			default_webhook_url: None,
			token_authority: TokenAuthorityConfig::default(),
			recipient: RecipientRules::default(),
			idle_threshold: Duration::from_secs(25),
			opening_timeout: Duration::from_secs(45),
			watchdog_interval: Duration::from_secs(5),
			probe_interval: Duration::from_secs(20),
			token_refresh: Duration::from_secs(300),
			http_timeout: Duration::from_secs(6),
		}
	}
}

impl OrchestratorConfig {
	/// Profile directory owned by `tenant`'s client.
	pub fn tenant_dir(&self, tenant: &str) -> PathBuf {
		self.state_root.join("tenants").join(tenant)
	}

	/// Token refresh interval with the safety floor applied.
	pub fn effective_token_refresh(&self) -> Duration {
		self.token_refresh.max(MIN_TOKEN_REFRESH)
	}
}

/// Endpoints and shared secret for the provider-token authority.
#[derive(Debug, Clone)]
pub struct TokenAuthorityConfig {
	pub base_url: String,
	pub shared_secret: String,
}

impl Default for TokenAuthorityConfig {
	fn default() -> Self {
		Self {
			base_url: "http://127.0.0.1:9000".to_string(),
			shared_secret: String::new(),
		}
	}
}

/// Recipient normalization rules.
#[derive(Debug, Clone)]
pub struct RecipientRules {
	/// Canonical address suffix (`<digits>@<suffix>`).
	pub suffix: String,
	/// Leading-digit correction applied before length validation.
	pub rewrite: Option<DigitRewrite>,
	pub min_digits: usize,
	pub max_digits: usize,
}

impl Default for RecipientRules {
	fn default() -> Self {
		Self {
			suffix: "c.us".to_string(),
			rewrite: Some(DigitRewrite {
				len: 11,
				prefix: '8',
				replacement: '7',
			}),
			min_digits: 10,
			max_digits: 15,
		}
	}
}

/// Rewrites the first digit of an exactly-`len`-digit number.
#[derive(Debug, Clone, Copy)]
pub struct DigitRewrite {
	pub len: usize,
	pub prefix: char,
	pub replacement: char,
}

/// Joins `state_root` helpers used by stores that only get the root path.
pub fn qr_snapshot_path(state_root: &Path) -> PathBuf {
	state_root.join("qr-latest.json")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_refresh_clamps_to_floor() {
		let mut cfg = OrchestratorConfig::default();
		cfg.token_refresh = Duration::from_secs(5);
		assert_eq!(cfg.effective_token_refresh(), MIN_TOKEN_REFRESH);

		cfg.token_refresh = Duration::from_secs(600);
		assert_eq!(cfg.effective_token_refresh(), Duration::from_secs(600));
	}

	#[test]
	fn tenant_dirs_are_scoped_under_state_root() {
		let cfg = OrchestratorConfig::default();
		assert!(cfg.tenant_dir("42").ends_with("tenants/42"));
	}
}
