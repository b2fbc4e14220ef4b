//! Per-tenant session state machine data.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Lifecycle states of a tenant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Init,
	Qr,
	Authenticated,
	Ready,
	Disconnected,
	Reinit,
	AuthFailure,
}

impl SessionState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Init => "init",
			Self::Qr => "qr",
			Self::Authenticated => "authenticated",
			Self::Ready => "ready",
			Self::Disconnected => "disconnected",
			Self::Reinit => "reinit",
			Self::AuthFailure => "auth_failure",
		}
	}
}

/// Rendered pairing artifact held while a session awaits a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrArtifact {
	pub id: String,
	pub text: String,
	pub svg: String,
	pub png_b64: String,
}

/// Mutable state of one tenant session, guarded by the entry's lock.
#[derive(Debug)]
pub struct SessionCore {
	pub state: SessionState,
	pub last_event: String,
	pub ready: bool,
	pub qr: Option<QrArtifact>,
	pub last_activity: Instant,
	pub state_since: Instant,
	pub conn_state: Option<String>,
	pub conn_state_since: Instant,
	pub last_probe: Option<Instant>,
	pub webhook_url: Option<String>,
}

impl SessionCore {
	pub fn new(webhook_url: Option<String>) -> Self {
		let now = Instant::now();
		Self {
			state: SessionState::Init,
			last_event: "created".to_string(),
			ready: false,
			qr: None,
			last_activity: now,
			state_since: now,
			conn_state: None,
			conn_state_since: now,
			last_probe: None,
			webhook_url,
		}
	}

	/// Moves to `next`, restamping `state_since` and enforcing the artifact
	/// invariant: the QR is only held while pairing is pending.
	pub fn transition(&mut self, next: SessionState) {
		let now = Instant::now();
		self.state = next;
		self.state_since = now;
		self.last_activity = now;
		self.ready = next == SessionState::Ready;
		if matches!(
			next,
			SessionState::Ready | SessionState::Authenticated | SessionState::Disconnected | SessionState::AuthFailure
		) {
			self.qr = None;
		}
	}

	/// Records the latest client event label for diagnostics.
	pub fn note_event(&mut self, label: &str) {
		self.last_event = label.to_string();
		self.last_activity = Instant::now();
	}

	/// True when the session has sat in a pre-pairing state without QR
	/// progress for longer than `threshold` (soft-reinit condition).
	pub fn is_idle_stuck(&self, threshold: Duration) -> bool {
		!self.ready && self.qr.is_none() && self.last_event != "qr" && self.state_since.elapsed() > threshold
	}

	/// Updates the probed connectivity value and returns how long it has
	/// now been unchanged.
	pub fn observe_conn_state(&mut self, state: &str) -> Duration {
		if self.conn_state.as_deref() != Some(state) {
			self.conn_state = Some(state.to_string());
			self.conn_state_since = Instant::now();
		}
		self.conn_state_since.elapsed()
	}

	pub fn snapshot(&self, tenant: &str) -> StatusSnapshot {
		StatusSnapshot {
			tenant: tenant.to_string(),
			state: self.state.as_str(),
			ready: self.ready,
			last_event: self.last_event.clone(),
			has_qr: self.qr.is_some(),
			qr_id: self.qr.as_ref().map(|qr| qr.id.clone()),
			state_age_secs: self.state_since.elapsed().as_secs(),
			webhook_url: self.webhook_url.clone(),
		}
	}
}

/// Serializable view of a session for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
	pub tenant: String,
	pub state: &'static str,
	pub ready: bool,
	pub last_event: String,
	pub has_qr: bool,
	pub qr_id: Option<String>,
	pub state_age_secs: u64,
	pub webhook_url: Option<String>,
}
