//! Env-driven configuration for the gateway binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use msgate::{OrchestratorConfig, TokenAuthorityConfig};

#[derive(Debug, Parser)]
#[command(name = "msgate", about = "Multi-tenant messaging session gateway", version)]
pub struct ServerConfig {
	/// Socket address the HTTP surface binds.
	#[arg(long, env = "MSGATE_BIND", default_value = "0.0.0.0:8088")]
	pub bind: String,
	/// Static bearer token gating the API; unset disables the gate.
	#[arg(long, env = "MSGATE_API_TOKEN")]
	pub api_token: Option<String>,
	/// Root directory for tenant profiles and the QR snapshot.
	#[arg(long, env = "MSGATE_STATE_DIR", default_value = "state")]
	pub state_dir: PathBuf,
	/// Default webhook destination for tenants without an override.
	#[arg(long, env = "MSGATE_WEBHOOK_URL")]
	pub webhook_url: Option<String>,
	/// Base URL of the provider-token authority.
	#[arg(long, env = "MSGATE_BACKEND_URL", default_value = "http://127.0.0.1:9000")]
	pub backend_url: String,
	/// Shared secret sent to the token authority.
	#[arg(long, env = "MSGATE_INTERNAL_SECRET", default_value = "")]
	pub internal_secret: String,
	/// Driver program spawned per tenant session.
	#[arg(long, env = "MSGATE_DRIVER_CMD", default_value = "msgate-driver")]
	pub driver_cmd: String,
	/// Channel tag reported in webhook payloads.
	#[arg(long, env = "MSGATE_CHANNEL", default_value = "whatsapp-web")]
	pub channel: String,
	/// Seconds between provider-token refreshes (floor 60).
	#[arg(long, env = "MSGATE_TOKEN_REFRESH_SECS", default_value_t = 300)]
	pub token_refresh_secs: u64,
	/// Seconds a pre-pairing session may stall before a soft reinit.
	#[arg(long, env = "MSGATE_IDLE_THRESHOLD_SECS", default_value_t = 25)]
	pub idle_threshold_secs: u64,
	/// Seconds the "opening" state may persist before a reset.
	#[arg(long, env = "MSGATE_OPENING_TIMEOUT_SECS", default_value_t = 45)]
	pub opening_timeout_secs: u64,
}

impl ServerConfig {
	pub fn orchestrator(&self) -> OrchestratorConfig {
		OrchestratorConfig {
			state_root: self.state_dir.clone(),
			channel: self.channel.clone(),
			default_webhook_url: self.webhook_url.clone(),
			token_authority: TokenAuthorityConfig {
				base_url: self.backend_url.clone(),
				shared_secret: self.internal_secret.clone(),
			},
			token_refresh: Duration::from_secs(self.token_refresh_secs),
			idle_threshold: Duration::from_secs(self.idle_threshold_secs),
			opening_timeout: Duration::from_secs(self.opening_timeout_secs),
			..OrchestratorConfig::default()
		}
	}
}
