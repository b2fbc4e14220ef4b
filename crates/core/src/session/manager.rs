//! Session orchestration: the single authority over tenant sessions.
//!
//! Owns the tenant table, the only code path that creates or destroys
//! clients, and the recovery actions (soft reinit, full reset) every other
//! component defers to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use msgate_client::{ChannelClient, ClientError, ClientEvent, ClientFactory, EventStream, MediaUpload, clear_stale_locks};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{GateError, Result};
use crate::metrics::Counters;
use crate::qr::QrStore;
use crate::session::recipient;
use crate::session::state::{QrArtifact, SessionCore, SessionState, StatusSnapshot};
use crate::token::ProviderTokenCache;
use crate::webhook::WebhookPipeline;

const STATE_DIR_DELETE_ATTEMPTS: u32 = 5;
const STATE_DIR_DELETE_DELAY: Duration = Duration::from_millis(200);

/// Outbound send request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
	pub to: String,
	#[serde(default)]
	pub text: Option<String>,
	#[serde(default)]
	pub attachments: Vec<Attachment>,
}

/// Attachment fetched by URL before delivery; mime/name overridable.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
	pub url: String,
	#[serde(default)]
	pub mime: Option<String>,
	#[serde(default)]
	pub filename: Option<String>,
}

/// Result of a successful send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
	pub recipient: String,
	pub message_ids: Vec<String>,
}

/// One tenant's live session entry.
pub struct TenantEntry {
	pub(crate) tenant: String,
	pub(crate) core: Mutex<SessionCore>,
	/// `None` while a reset is replacing the client.
	pub(crate) client: RwLock<Option<Arc<dyn ChannelClient>>>,
	pub(crate) reset_in_progress: AtomicBool,
	/// Bumped whenever the client is replaced; stale event consumers exit.
	pub(crate) epoch: AtomicU64,
}

struct Shared {
	cfg: OrchestratorConfig,
	factory: Arc<dyn ClientFactory>,
	sessions: Mutex<HashMap<String, Arc<TenantEntry>>>,
	webhook: WebhookPipeline,
	qr_store: QrStore,
	tokens: Arc<ProviderTokenCache>,
	counters: Arc<Counters>,
	http: reqwest::Client,
}

/// Cloneable handle on the orchestration state.
#[derive(Clone)]
pub struct SessionManager {
	shared: Arc<Shared>,
}

impl SessionManager {
	/// Builds the orchestrator and seeds the QR cache from disk.
	pub fn new(cfg: OrchestratorConfig, factory: Arc<dyn ClientFactory>) -> Result<Self> {
		std::fs::create_dir_all(&cfg.state_root)?;
		let http = reqwest::Client::builder().timeout(cfg.http_timeout).build()?;
		let counters = Arc::new(Counters::default());
		let tokens = Arc::new(ProviderTokenCache::new(
			http.clone(),
			cfg.token_authority.clone(),
			cfg.effective_token_refresh(),
		));
		let webhook = WebhookPipeline::new(
			http.clone(),
			Arc::clone(&tokens),
			Arc::clone(&counters),
			cfg.channel.clone(),
			cfg.default_webhook_url.clone(),
		);
		let qr_store = QrStore::new(&cfg.state_root);
		let _ = qr_store.snapshot();

		Ok(Self {
			shared: Arc::new(Shared {
				cfg,
				factory,
				sessions: Mutex::new(HashMap::new()),
				webhook,
				qr_store,
				tokens,
				counters,
				http,
			}),
		})
	}

	/// Starts the watchdog and the token-refresh sweep.
	pub fn spawn_background(&self) {
		crate::watchdog::spawn(self.clone());
		spawn_token_sweep(self.clone());
	}

	/// Returns the session for `tenant`, creating it on first use. A session
	/// that has stalled before pairing is rebuilt in place before returning.
	pub async fn ensure(&self, tenant: &str, webhook_url: Option<String>) -> Result<StatusSnapshot> {
		let (entry, created) = self.entry_or_reserve(tenant, webhook_url.clone());
		if created {
			if let Err(err) = self.attach_client(&entry) {
				self.shared.sessions.lock().remove(tenant);
				return Err(err);
			}
			info!(target = "gate.session", tenant, "session created");
		} else {
			if let Some(url) = webhook_url {
				entry.core.lock().webhook_url = Some(url);
			}
			let stuck = entry.core.lock().is_idle_stuck(self.shared.cfg.idle_threshold);
			if stuck {
				self.soft_reinit(&entry).await;
			}
		}
		Ok(entry.core.lock().snapshot(tenant))
	}

	/// Normalizes the recipient and delivers text/attachments through the
	/// tenant's client.
	pub async fn send(&self, tenant: &str, request: SendRequest) -> Result<SendReceipt> {
		let entry = self
			.shared
			.sessions
			.lock()
			.get(tenant)
			.cloned()
			.ok_or_else(|| GateError::NoSession(tenant.to_string()))?;
		let client = entry
			.client
			.read()
			.clone()
			.ok_or_else(|| GateError::NoSession(tenant.to_string()))?;

		let identity = client.identity();
		let recipient = recipient::normalize(&request.to, identity.as_deref(), &self.shared.cfg.recipient)?;

		let mut message_ids = Vec::new();
		let mut caption = request.text.as_deref().filter(|text| !text.is_empty());
		for attachment in &request.attachments {
			let media = self.fetch_media(attachment, &recipient).await?;
			let id = client
				.send_media(&recipient, &media, caption)
				.await
				.map_err(|err| GateError::MediaFetchFailed {
					recipient: recipient.clone(),
					detail: err.to_string(),
				})?;
			message_ids.push(id);
			// Only the first attachment carries the text.
			caption = None;
		}
		if let Some(text) = caption {
			let id = client.send_text(&recipient, text).await?;
			message_ids.push(id);
		}

		entry.core.lock().note_event("send");
		self.shared.counters.record_message_out();
		Ok(SendReceipt { recipient, message_ids })
	}

	/// Destroys the session wholesale — client, in-memory entry, on-disk
	/// pairing state — and rebuilds it from scratch.
	pub async fn reset(&self, tenant: &str, webhook_url: Option<String>) -> Result<StatusSnapshot> {
		let mut carried_webhook = webhook_url;
		let existing = self.shared.sessions.lock().get(tenant).cloned();
		if let Some(entry) = existing {
			if entry.reset_in_progress.swap(true, Ordering::SeqCst) {
				debug!(target = "gate.session", tenant, "reset already in progress");
				return Ok(entry.core.lock().snapshot(tenant));
			}
			self.shared.counters.record_reset();
			entry.epoch.fetch_add(1, Ordering::SeqCst);
			if carried_webhook.is_none() {
				carried_webhook = entry.core.lock().webhook_url.clone();
			}

			let client = entry.client.write().take();
			if let Some(client) = client {
				if let Err(err) = client.destroy().await {
					debug!(target = "gate.session", tenant, error = %err, "client destroy failed during reset");
				}
			}
			self.remove_state_dir(tenant).await;
			self.shared.sessions.lock().remove(tenant);
			entry.reset_in_progress.store(false, Ordering::SeqCst);
			info!(target = "gate.session", tenant, "session torn down; rebuilding");
		}
		self.ensure(tenant, carried_webhook).await
	}

	/// Queues an asynchronous reset; a no-op while one is already running.
	/// Event handlers use this so recovery never blocks the event consumer.
	pub fn schedule_reset(&self, tenant: &str, source: &'static str) {
		if let Some(entry) = self.shared.sessions.lock().get(tenant) {
			if entry.reset_in_progress.load(Ordering::SeqCst) {
				debug!(target = "gate.session", tenant, source, "reset already scheduled");
				return;
			}
		}
		info!(target = "gate.session", tenant, source, "scheduling session reset");
		let manager = self.clone();
		let tenant = tenant.to_string();
		tokio::spawn(async move {
			if let Err(err) = manager.reset(&tenant, None).await {
				warn!(target = "gate.session", tenant = %tenant, error = %err, "scheduled reset failed");
			}
		});
	}

	pub fn status(&self, tenant: &str) -> Result<StatusSnapshot> {
		let entry = self
			.shared
			.sessions
			.lock()
			.get(tenant)
			.cloned()
			.ok_or_else(|| GateError::NoSession(tenant.to_string()))?;
		let snapshot = entry.core.lock().snapshot(tenant);
		Ok(snapshot)
	}

	/// Pairing artifact for `tenant`: live session state first, then the
	/// persisted global snapshot (covers the window right after a restart).
	/// A ready session needs no pairing and never serves a stale code.
	pub fn qr_for(&self, tenant: &str) -> Option<QrArtifact> {
		if let Some(entry) = self.shared.sessions.lock().get(tenant) {
			let core = entry.core.lock();
			if core.ready {
				return None;
			}
			if let Some(qr) = core.qr.clone() {
				return Some(qr);
			}
		}
		self.shared.qr_store.artifact_for(tenant)
	}

	pub fn tenants(&self) -> Vec<String> {
		self.shared.sessions.lock().keys().cloned().collect()
	}

	pub fn counters(&self) -> Arc<Counters> {
		Arc::clone(&self.shared.counters)
	}

	pub fn config(&self) -> &OrchestratorConfig {
		&self.shared.cfg
	}

	pub(crate) fn entries(&self) -> Vec<Arc<TenantEntry>> {
		self.shared.sessions.lock().values().cloned().collect()
	}

	/// Rebuilds the client in place, preserving stored pairing state.
	pub(crate) async fn soft_reinit(&self, entry: &Arc<TenantEntry>) {
		if entry.reset_in_progress.swap(true, Ordering::SeqCst) {
			return;
		}
		info!(target = "gate.session", tenant = %entry.tenant, "soft reinit of stalled client");
		self.shared.counters.record_soft_reinit();
		entry.epoch.fetch_add(1, Ordering::SeqCst);

		let old = entry.client.write().take();
		if let Some(client) = old {
			let _ = client.destroy().await;
		}
		entry.core.lock().transition(SessionState::Reinit);

		match self.attach_client(entry) {
			Ok(()) => entry.core.lock().transition(SessionState::Init),
			Err(err) => warn!(target = "gate.session", tenant = %entry.tenant, error = %err, "soft reinit failed to recreate client"),
		}
		entry.reset_in_progress.store(false, Ordering::SeqCst);
	}

	fn entry_or_reserve(&self, tenant: &str, webhook_url: Option<String>) -> (Arc<TenantEntry>, bool) {
		let mut sessions = self.shared.sessions.lock();
		if let Some(entry) = sessions.get(tenant) {
			return (Arc::clone(entry), false);
		}
		let entry = Arc::new(TenantEntry {
			tenant: tenant.to_string(),
			core: Mutex::new(SessionCore::new(webhook_url)),
			client: RwLock::new(None),
			reset_in_progress: AtomicBool::new(false),
			epoch: AtomicU64::new(0),
		});
		sessions.insert(tenant.to_string(), Arc::clone(&entry));
		(entry, true)
	}

	/// Creates and wires a client for `entry`: profile dir, stale-lock
	/// cleanup, event consumer, and non-blocking initialization.
	fn attach_client(&self, entry: &Arc<TenantEntry>) -> Result<()> {
		let profile_dir = self.shared.cfg.tenant_dir(&entry.tenant);
		std::fs::create_dir_all(&profile_dir)?;
		match clear_stale_locks(&profile_dir) {
			Ok(0) => {}
			Ok(removed) => info!(target = "gate.session", tenant = %entry.tenant, removed, "cleared stale profile locks"),
			Err(err) => warn!(target = "gate.session", tenant = %entry.tenant, error = %err, "lock cleanup failed"),
		}

		let (client, events) = self.shared.factory.create(&entry.tenant, &profile_dir)?;
		*entry.client.write() = Some(Arc::clone(&client));
		let epoch = entry.epoch.load(Ordering::SeqCst);
		tokio::spawn(consume_events(self.clone(), Arc::clone(entry), events, epoch));

		let manager = self.clone();
		let init_entry = Arc::clone(entry);
		tokio::spawn(async move {
			if let Err(err) = client.initialize().await {
				warn!(target = "gate.session", tenant = %init_entry.tenant, error = %err, "client initialization failed");
				init_entry.core.lock().note_event("init_failed");
				if matches!(err, ClientError::Singleton(_)) {
					// Another process holds the profile; retrying in place
					// cannot win the lock.
					let profile_dir = manager.shared.cfg.tenant_dir(&init_entry.tenant);
					let _ = clear_stale_locks(&profile_dir);
					manager.schedule_reset(&init_entry.tenant, "singleton_conflict");
				}
			}
		});
		Ok(())
	}

	async fn fetch_media(&self, attachment: &Attachment, recipient: &str) -> Result<MediaUpload> {
		let fetch_failed = |detail: String| GateError::MediaFetchFailed {
			recipient: recipient.to_string(),
			detail,
		};
		let response = self
			.shared
			.http
			.get(&attachment.url)
			.send()
			.await
			.map_err(|err| fetch_failed(err.to_string()))?;
		if !response.status().is_success() {
			return Err(fetch_failed(format!("{} returned {}", attachment.url, response.status())));
		}
		let mime = attachment
			.mime
			.clone()
			.or_else(|| {
				response
					.headers()
					.get(reqwest::header::CONTENT_TYPE)
					.and_then(|value| value.to_str().ok())
					.map(str::to_string)
			})
			.unwrap_or_else(|| "application/octet-stream".to_string());
		let bytes = response.bytes().await.map_err(|err| fetch_failed(err.to_string()))?.to_vec();
		let filename = attachment
			.filename
			.clone()
			.unwrap_or_else(|| filename_from_url(&attachment.url));
		Ok(MediaUpload { bytes, mime, filename })
	}

	async fn remove_state_dir(&self, tenant: &str) {
		let dir = self.shared.cfg.tenant_dir(tenant);
		for attempt in 1..=STATE_DIR_DELETE_ATTEMPTS {
			match tokio::fs::remove_dir_all(&dir).await {
				Ok(()) => return,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
				Err(err) => {
					// A just-destroyed client may still hold file handles.
					debug!(target = "gate.session", tenant, attempt, error = %err, "state dir removal failed");
					if attempt < STATE_DIR_DELETE_ATTEMPTS {
						sleep(STATE_DIR_DELETE_DELAY).await;
					} else {
						warn!(target = "gate.session", tenant, error = %err, "giving up on state dir removal");
					}
				}
			}
		}
	}
}

async fn consume_events(manager: SessionManager, entry: Arc<TenantEntry>, mut events: EventStream, epoch: u64) {
	while let Some(event) = events.recv().await {
		if entry.epoch.load(Ordering::SeqCst) != epoch {
			break;
		}
		handle_event(&manager, &entry, event).await;
	}
	debug!(target = "gate.session", tenant = %entry.tenant, "event stream closed");
}

async fn handle_event(manager: &SessionManager, entry: &Arc<TenantEntry>, event: ClientEvent) {
	let shared = &manager.shared;
	let tenant = entry.tenant.clone();
	match event {
		ClientEvent::QrIssued { code } => {
			shared.counters.record_qr_issued();
			let artifact = match shared.qr_store.record(&tenant, &code, None) {
				Ok(artifact) => artifact,
				Err(err) => {
					warn!(target = "gate.qr", tenant = %tenant, error = %err, "failed to render qr");
					return;
				}
			};
			let webhook_url = {
				let mut core = entry.core.lock();
				core.transition(SessionState::Qr);
				core.qr = Some(artifact.clone());
				core.note_event("qr");
				core.webhook_url.clone()
			};
			let manager = manager.clone();
			tokio::spawn(async move {
				manager.shared.webhook.deliver_qr(&tenant, webhook_url.as_deref(), &artifact).await;
			});
		}
		ClientEvent::Authenticated => {
			let mut core = entry.core.lock();
			core.transition(SessionState::Authenticated);
			core.note_event("authenticated");
		}
		ClientEvent::AuthFailure { reason } => {
			// Terminal until an external reset.
			warn!(target = "gate.session", tenant = %tenant, reason, "authentication failure");
			let mut core = entry.core.lock();
			core.transition(SessionState::AuthFailure);
			core.note_event("auth_failure");
		}
		ClientEvent::Ready => {
			let webhook_url = {
				let mut core = entry.core.lock();
				core.transition(SessionState::Ready);
				core.note_event("ready");
				core.webhook_url.clone()
			};
			info!(target = "gate.session", tenant = %tenant, "session ready");
			let manager = manager.clone();
			tokio::spawn(async move {
				manager.shared.webhook.notify_ready(&tenant, webhook_url.as_deref()).await;
			});
		}
		ClientEvent::Disconnected { reason } => {
			{
				let mut core = entry.core.lock();
				core.transition(SessionState::Disconnected);
				core.note_event("disconnected");
			}
			if reason.to_lowercase().contains("logout") {
				// Remote side severed pairing; stored session data is stale.
				manager.schedule_reset(&tenant, "logout");
			} else {
				debug!(target = "gate.session", tenant = %tenant, reason, "client disconnected");
			}
		}
		ClientEvent::StateChanged { state } => {
			let lowered = state.to_lowercase();
			entry.core.lock().note_event(&lowered);
			if lowered.contains("unpaired") || lowered.contains("logged out") {
				manager.schedule_reset(&tenant, "unpaired_state");
			}
		}
		ClientEvent::MessageReceived(message) => {
			shared.counters.record_message_in();
			let webhook_url = {
				let mut core = entry.core.lock();
				core.note_event("message");
				core.webhook_url.clone()
			};
			let manager = manager.clone();
			tokio::spawn(async move {
				manager.shared.webhook.notify_message(&tenant, webhook_url.as_deref(), &message).await;
			});
		}
	}
}

fn spawn_token_sweep(manager: SessionManager) {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(manager.shared.cfg.effective_token_refresh());
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// First tick fires immediately; skip it so startup does not race
		// tenant creation.
		ticker.tick().await;
		loop {
			ticker.tick().await;
			for tenant in manager.tenants() {
				if let Err(err) = manager.shared.tokens.ensure(&tenant, true).await {
					debug!(target = "gate.token", tenant = %tenant, error = %err, "sweep refresh failed");
				}
			}
		}
	});
}

fn filename_from_url(url: &str) -> String {
	url.split(['?', '#'])
		.next()
		.and_then(|path| path.rsplit('/').next())
		.filter(|name| !name.is_empty() && !name.contains(':'))
		.unwrap_or("attachment")
		.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn filename_extraction_handles_queries_and_bare_hosts() {
		assert_eq!(filename_from_url("https://example.test/files/photo.png?sig=abc"), "photo.png");
		assert_eq!(filename_from_url("https://example.test/doc.pdf#page=2"), "doc.pdf");
		assert_eq!(filename_from_url("https://example.test/"), "attachment");
		assert_eq!(filename_from_url("plain"), "plain");
	}
}
