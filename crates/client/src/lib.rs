//! Messaging-client contract and implementations.
//!
//! Defines the event/command surface the orchestration core consumes: a
//! client emits lifecycle events over a channel and accepts send/probe
//! commands. Production uses the sidecar driver bridge; orchestration tests
//! use the scripted in-process client.

/// Sidecar driver process bridge speaking NDJSON over stdio.
pub mod driver;
/// Stale profile-lock cleanup for crashed predecessor processes.
pub mod locks;
/// Scripted in-process client used by orchestration tests.
pub mod testing;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use driver::{DriverClient, DriverFactory};
pub use locks::clear_stale_locks;

/// Errors surfaced by client implementations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// Another process holds the tenant profile (browser singleton lock).
	#[error("profile singleton conflict: {0}")]
	Singleton(String),
	/// Malformed or unexpected driver traffic.
	#[error("driver protocol error: {0}")]
	Protocol(String),
	/// The driver did not answer within the command timeout.
	#[error("driver command timed out")]
	Timeout,
	/// The driver process exited or its pipes are closed.
	#[error("driver connection closed")]
	Closed,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Lifecycle and inbound-traffic events emitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	QrIssued { code: String },
	Authenticated,
	AuthFailure { reason: String },
	Ready,
	Disconnected { reason: String },
	StateChanged { state: String },
	MessageReceived(InboundMessage),
}

/// Inbound message as reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
	pub id: String,
	pub from: String,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub media: Vec<InboundMedia>,
}

/// Media descriptor attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMedia {
	pub mime: String,
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub filename: Option<String>,
}

/// Cheap liveness booleans a client can answer without a full probe.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
	pub connected: bool,
	pub page_open: bool,
}

impl Liveness {
	/// Both the connection and the automated page are up.
	pub fn is_alive(&self) -> bool {
		self.connected && self.page_open
	}
}

/// Outbound media payload, already fetched by the caller.
#[derive(Debug, Clone)]
pub struct MediaUpload {
	pub bytes: Vec<u8>,
	pub mime: String,
	pub filename: String,
}

/// Command surface of one tenant's messaging client.
///
/// Implementations own the underlying automation engine; the orchestration
/// core only observes events and issues these commands.
#[async_trait]
pub trait ChannelClient: Send + Sync {
	/// Starts session bring-up; progress is reported through events.
	async fn initialize(&self) -> Result<(), ClientError>;
	/// Best-effort teardown of the underlying client.
	async fn destroy(&self) -> Result<(), ClientError>;
	/// Sends a text message, returning the provider message id.
	async fn send_text(&self, recipient: &str, text: &str) -> Result<String, ClientError>;
	/// Sends one media item with an optional caption.
	async fn send_media(&self, recipient: &str, media: &MediaUpload, caption: Option<&str>) -> Result<String, ClientError>;
	/// Queries the client's own connectivity state string.
	async fn connectivity_state(&self) -> Result<String, ClientError>;
	/// Liveness booleans; never fails, unknown reads as down.
	async fn liveness(&self) -> Liveness;
	/// Canonical own identity digits once pairing has established them.
	fn identity(&self) -> Option<String>;
}

/// Receiver half of a client's event stream.
pub type EventStream = mpsc::Receiver<ClientEvent>;

/// Creates clients bound to a tenant profile directory.
pub trait ClientFactory: Send + Sync {
	fn create(&self, tenant: &str, profile_dir: &Path) -> Result<(Arc<dyn ChannelClient>, EventStream), ClientError>;
}
