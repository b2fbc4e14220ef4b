//! Aggregated counters exposed through the metrics surface.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters. Webhook outcomes use the stable label set from
/// [`crate::webhook::DeliveryOutcome`].
#[derive(Debug, Default)]
pub struct Counters {
	messages_out: AtomicU64,
	messages_in: AtomicU64,
	qr_issued: AtomicU64,
	resets: AtomicU64,
	soft_reinits: AtomicU64,
	webhook_ok: AtomicU64,
	webhook_unauthorized: AtomicU64,
	webhook_invalid: AtomicU64,
	webhook_error: AtomicU64,
	webhook_no_token: AtomicU64,
	webhook_exception: AtomicU64,
	webhook_no_session: AtomicU64,
}

impl Counters {
	pub fn record_message_out(&self) {
		self.messages_out.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_message_in(&self) {
		self.messages_in.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_qr_issued(&self) {
		self.qr_issued.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_reset(&self) {
		self.resets.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_soft_reinit(&self) {
		self.soft_reinits.fetch_add(1, Ordering::Relaxed);
	}

	/// Records one webhook delivery outcome by its stable label.
	pub fn record_webhook(&self, label: &str) {
		let counter = match label {
			"ok" => &self.webhook_ok,
			"unauthorized" => &self.webhook_unauthorized,
			"invalid" => &self.webhook_invalid,
			"error" => &self.webhook_error,
			"no_token" => &self.webhook_no_token,
			"exception" => &self.webhook_exception,
			"no_session" => &self.webhook_no_session,
			_ => return,
		};
		counter.fetch_add(1, Ordering::Relaxed);
	}

	/// Point-in-time values as `(metric name, value)` pairs.
	pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
		vec![
			("messages_out_total", self.messages_out.load(Ordering::Relaxed)),
			("messages_in_total", self.messages_in.load(Ordering::Relaxed)),
			("qr_issued_total", self.qr_issued.load(Ordering::Relaxed)),
			("session_resets_total", self.resets.load(Ordering::Relaxed)),
			("soft_reinits_total", self.soft_reinits.load(Ordering::Relaxed)),
			("webhook_deliveries_total{outcome=\"ok\"}", self.webhook_ok.load(Ordering::Relaxed)),
			(
				"webhook_deliveries_total{outcome=\"unauthorized\"}",
				self.webhook_unauthorized.load(Ordering::Relaxed),
			),
			("webhook_deliveries_total{outcome=\"invalid\"}", self.webhook_invalid.load(Ordering::Relaxed)),
			("webhook_deliveries_total{outcome=\"error\"}", self.webhook_error.load(Ordering::Relaxed)),
			("webhook_deliveries_total{outcome=\"no_token\"}", self.webhook_no_token.load(Ordering::Relaxed)),
			("webhook_deliveries_total{outcome=\"exception\"}", self.webhook_exception.load(Ordering::Relaxed)),
			("webhook_deliveries_total{outcome=\"no_session\"}", self.webhook_no_session.load(Ordering::Relaxed)),
		]
	}
}
