//! Webhook delivery pipeline toward the partner backend.
//!
//! Every delivery resolves a provider token per attempt and classifies its
//! outcome into a stable label set — the labels feed aggregated counters and
//! must not change meaning.

use std::sync::Arc;
use std::time::Duration;

use msgate_client::InboundMessage;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::metrics::Counters;
use crate::qr::now_ms;
use crate::retry::{Backoff, linear_delay};
use crate::session::QrArtifact;
use crate::token::ProviderTokenCache;

const MAX_ATTEMPTS: u32 = 3;
const AUTH_BACKOFF: Backoff = Backoff::new(250, 1500);
const SERVER_BACKOFF: Backoff = Backoff::new(400, 2500);
const QR_OUTER_ATTEMPTS: u32 = 3;
const QR_OUTER_BASE_DELAY: Duration = Duration::from_millis(500);

/// Stable classification of one delivery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
	Ok,
	Unauthorized,
	Invalid,
	Error,
	NoToken,
	Exception,
	NoSession,
}

impl DeliveryOutcome {
	pub fn label(self) -> &'static str {
		match self {
			Self::Ok => "ok",
			Self::Unauthorized => "unauthorized",
			Self::Invalid => "invalid",
			Self::Error => "error",
			Self::NoToken => "no_token",
			Self::Exception => "exception",
			Self::NoSession => "no_session",
		}
	}

	pub fn is_success(self) -> bool {
		self == Self::Ok
	}
}

pub struct WebhookPipeline {
	http: reqwest::Client,
	tokens: Arc<ProviderTokenCache>,
	counters: Arc<Counters>,
	channel: String,
	default_url: Option<String>,
}

impl WebhookPipeline {
	pub fn new(
		http: reqwest::Client,
		tokens: Arc<ProviderTokenCache>,
		counters: Arc<Counters>,
		channel: String,
		default_url: Option<String>,
	) -> Self {
		Self {
			http,
			tokens,
			counters,
			channel,
			default_url,
		}
	}

	/// Delivers `payload` for `tenant`, recording the classified outcome.
	///
	/// Retry matrix, up to three attempts: 401 forces a token refresh and
	/// backs off 250ms..1500ms; 5xx backs off 400ms..2500ms without a
	/// refresh; a network failure retries with a refresh. Anything else
	/// terminates the loop immediately.
	pub async fn send_event(&self, tenant: &str, url: Option<&str>, payload: &Value) -> DeliveryOutcome {
		let outcome = self.attempt_loop(tenant, url, payload).await;
		self.counters.record_webhook(outcome.label());
		outcome
	}

	async fn attempt_loop(&self, tenant: &str, url: Option<&str>, payload: &Value) -> DeliveryOutcome {
		let Some(url) = url.or(self.default_url.as_deref()) else {
			debug!(target = "gate.webhook", tenant, "no webhook destination configured");
			return DeliveryOutcome::NoSession;
		};

		let mut force_refresh = false;
		for attempt in 1..=MAX_ATTEMPTS {
			let token = match self.tokens.ensure(tenant, force_refresh).await {
				Ok(token) => token,
				Err(err) => {
					warn!(target = "gate.webhook", tenant, error = %err, "delivery skipped without token");
					return DeliveryOutcome::NoToken;
				}
			};

			let result = self.http.post(url).query(&[("token", token.as_str())]).json(payload).send().await;
			let status = match result {
				Ok(response) => response.status(),
				Err(err) => {
					warn!(target = "gate.webhook", tenant, attempt, error = %err, "delivery attempt failed");
					if attempt == MAX_ATTEMPTS {
						return DeliveryOutcome::Exception;
					}
					force_refresh = true;
					sleep(SERVER_BACKOFF.delay(attempt)).await;
					continue;
				}
			};

			if status.is_success() {
				return DeliveryOutcome::Ok;
			}
			if status == StatusCode::UNAUTHORIZED {
				if attempt == MAX_ATTEMPTS {
					return DeliveryOutcome::Unauthorized;
				}
				debug!(target = "gate.webhook", tenant, attempt, "unauthorized; refreshing token");
				force_refresh = true;
				sleep(AUTH_BACKOFF.delay(attempt)).await;
			} else if status.is_server_error() {
				if attempt == MAX_ATTEMPTS {
					return DeliveryOutcome::Error;
				}
				debug!(target = "gate.webhook", tenant, attempt, %status, "server error; retrying");
				force_refresh = false;
				sleep(SERVER_BACKOFF.delay(attempt)).await;
			} else {
				debug!(target = "gate.webhook", tenant, %status, "delivery rejected");
				return DeliveryOutcome::Invalid;
			}
		}
		DeliveryOutcome::Error
	}

	/// QR notification with its own outer retry loop. Exhaustion is logged
	/// but never fails session bootstrap.
	pub async fn deliver_qr(&self, tenant: &str, url: Option<&str>, artifact: &QrArtifact) -> DeliveryOutcome {
		let payload = json!({
			"event": "qr",
			"tenant": tenant,
			"channel": self.channel,
			"qr_id": artifact.id,
			"svg": artifact.svg,
		});

		let mut last = DeliveryOutcome::Error;
		for attempt in 1..=QR_OUTER_ATTEMPTS {
			last = self.send_event(tenant, url, &payload).await;
			match last {
				DeliveryOutcome::Ok => return last,
				DeliveryOutcome::Invalid => {
					warn!(target = "gate.webhook", tenant, "webhook permanently rejected qr notification");
					return last;
				}
				_ if attempt < QR_OUTER_ATTEMPTS => sleep(linear_delay(QR_OUTER_BASE_DELAY, attempt)).await,
				_ => {}
			}
		}
		warn!(target = "gate.webhook", tenant, outcome = last.label(), "giving up on qr delivery");
		last
	}

	pub async fn notify_ready(&self, tenant: &str, url: Option<&str>) -> DeliveryOutcome {
		let payload = json!({
			"event": "ready",
			"tenant": tenant,
			"channel": self.channel,
			"state": "ready",
			"ts": now_ms(),
		});
		self.send_event(tenant, url, &payload).await
	}

	pub async fn notify_message(&self, tenant: &str, url: Option<&str>, message: &InboundMessage) -> DeliveryOutcome {
		let payload = json!({
			"event": "message",
			"tenant": tenant,
			"channel": self.channel,
			"message_id": message.id,
			"from": message.from,
			"text": message.text,
			"media": message.media,
		});
		self.send_event(tenant, url, &payload).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn outcome_labels_are_stable() {
		let labeled = [
			(DeliveryOutcome::Ok, "ok"),
			(DeliveryOutcome::Unauthorized, "unauthorized"),
			(DeliveryOutcome::Invalid, "invalid"),
			(DeliveryOutcome::Error, "error"),
			(DeliveryOutcome::NoToken, "no_token"),
			(DeliveryOutcome::Exception, "exception"),
			(DeliveryOutcome::NoSession, "no_session"),
		];
		for (outcome, label) in labeled {
			assert_eq!(outcome.label(), label);
		}
		assert!(DeliveryOutcome::Ok.is_success());
		assert!(!DeliveryOutcome::Error.is_success());
	}
}
