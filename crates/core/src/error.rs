//! Error taxonomy for the orchestration layer.

use msgate_client::ClientError;

/// Failures surfaced by the orchestration core.
///
/// API-boundary conditions (`NoSession`, `InvalidRecipient`,
/// `MediaFetchFailed`) are reported to callers as structured values;
/// recovery-class conditions are handled internally with bounded retries or
/// a session reset.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
	#[error("no active session for tenant {0}")]
	NoSession(String),
	#[error("invalid recipient: {0}")]
	InvalidRecipient(String),
	#[error("media fetch failed for {recipient}: {detail}")]
	MediaFetchFailed { recipient: String, detail: String },
	#[error("partner backend rejected credentials")]
	Unauthorized,
	#[error("no provider token available for tenant {0}")]
	TokenUnavailable(String),
	#[error("transient network failure: {0}")]
	Transient(String),
	#[error("authentication failure: {0}")]
	TerminalAuthFailure(String),
	#[error("profile lock conflict: {0}")]
	LockConflict(String),
	#[error("qr render failed: {0}")]
	QrRender(String),
	#[error(transparent)]
	Client(#[from] ClientError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for GateError {
	fn from(err: reqwest::Error) -> Self {
		GateError::Transient(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, GateError>;
