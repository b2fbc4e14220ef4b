//! Scripted in-process client used by orchestration tests.
//!
//! Tests drive lifecycle events through the factory's handles and assert on
//! recorded commands, without any driver process.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{ChannelClient, ClientError, ClientEvent, ClientFactory, EventStream, Liveness, MediaUpload};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Factory producing [`ScriptedClient`]s and retaining handles to drive them.
#[derive(Default)]
pub struct ScriptedFactory {
	created: AtomicUsize,
	handles: Mutex<Vec<ScriptedHandle>>,
	fail_next_init: Mutex<Option<String>>,
}

/// Test-side handle on one created client: the client and its event sender.
#[derive(Clone)]
pub struct ScriptedHandle {
	pub client: Arc<ScriptedClient>,
	pub events: mpsc::Sender<ClientEvent>,
}

impl ScriptedFactory {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Number of clients created so far.
	pub fn created(&self) -> usize {
		self.created.load(Ordering::SeqCst)
	}

	pub fn handle(&self, index: usize) -> Option<ScriptedHandle> {
		self.handles.lock().get(index).cloned()
	}

	pub fn latest(&self) -> Option<ScriptedHandle> {
		self.handles.lock().last().cloned()
	}

	/// Makes the next created client fail `initialize` with a singleton
	/// conflict carrying `message`.
	pub fn fail_next_init_with_singleton(&self, message: &str) {
		*self.fail_next_init.lock() = Some(message.to_string());
	}
}

impl ClientFactory for ScriptedFactory {
	fn create(&self, tenant: &str, _profile_dir: &Path) -> Result<(Arc<dyn ChannelClient>, EventStream), ClientError> {
		self.created.fetch_add(1, Ordering::SeqCst);
		let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		let client = Arc::new(ScriptedClient {
			tenant: tenant.to_string(),
			init_error: Mutex::new(self.fail_next_init.lock().take()),
			..ScriptedClient::default()
		});
		self.handles.lock().push(ScriptedHandle {
			client: Arc::clone(&client),
			events: events_tx,
		});
		Ok((client, events_rx))
	}
}

/// In-process fake with programmable probe results and recorded commands.
pub struct ScriptedClient {
	pub tenant: String,
	identity: Mutex<Option<String>>,
	liveness: Mutex<Liveness>,
	conn_state: Mutex<Result<String, String>>,
	init_error: Mutex<Option<String>>,
	fail_sends: AtomicBool,
	init_calls: AtomicUsize,
	destroy_calls: AtomicUsize,
	next_message: AtomicUsize,
	sent_texts: Mutex<Vec<(String, String)>>,
	sent_media: Mutex<Vec<(String, String, Option<String>)>>,
}

impl Default for ScriptedClient {
	fn default() -> Self {
		Self {
			tenant: String::new(),
			identity: Mutex::new(None),
			liveness: Mutex::new(Liveness { connected: true, page_open: true }),
			conn_state: Mutex::new(Ok("connected".to_string())),
			init_error: Mutex::new(None),
			fail_sends: AtomicBool::new(false),
			init_calls: AtomicUsize::new(0),
			destroy_calls: AtomicUsize::new(0),
			next_message: AtomicUsize::new(1),
			sent_texts: Mutex::new(Vec::new()),
			sent_media: Mutex::new(Vec::new()),
		}
	}
}

impl ScriptedClient {
	pub fn set_identity(&self, digits: &str) {
		*self.identity.lock() = Some(digits.to_string());
	}

	pub fn set_liveness(&self, connected: bool, page_open: bool) {
		*self.liveness.lock() = Liveness { connected, page_open };
	}

	pub fn set_connectivity_state(&self, state: &str) {
		*self.conn_state.lock() = Ok(state.to_string());
	}

	pub fn fail_connectivity_probe(&self, message: &str) {
		*self.conn_state.lock() = Err(message.to_string());
	}

	pub fn fail_sends(&self, fail: bool) {
		self.fail_sends.store(fail, Ordering::SeqCst);
	}

	pub fn init_calls(&self) -> usize {
		self.init_calls.load(Ordering::SeqCst)
	}

	pub fn destroy_calls(&self) -> usize {
		self.destroy_calls.load(Ordering::SeqCst)
	}

	pub fn sent_texts(&self) -> Vec<(String, String)> {
		self.sent_texts.lock().clone()
	}

	/// Recorded media sends as `(recipient, filename, caption)`.
	pub fn sent_media(&self) -> Vec<(String, String, Option<String>)> {
		self.sent_media.lock().clone()
	}
}

#[async_trait]
impl ChannelClient for ScriptedClient {
	async fn initialize(&self) -> Result<(), ClientError> {
		self.init_calls.fetch_add(1, Ordering::SeqCst);
		if let Some(message) = self.init_error.lock().take() {
			return Err(ClientError::Singleton(message));
		}
		Ok(())
	}

	async fn destroy(&self) -> Result<(), ClientError> {
		self.destroy_calls.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn send_text(&self, recipient: &str, text: &str) -> Result<String, ClientError> {
		if self.fail_sends.load(Ordering::SeqCst) {
			return Err(ClientError::Protocol("scripted send failure".to_string()));
		}
		self.sent_texts.lock().push((recipient.to_string(), text.to_string()));
		Ok(format!("msg-{}", self.next_message.fetch_add(1, Ordering::SeqCst)))
	}

	async fn send_media(&self, recipient: &str, media: &MediaUpload, caption: Option<&str>) -> Result<String, ClientError> {
		if self.fail_sends.load(Ordering::SeqCst) {
			return Err(ClientError::Protocol("scripted send failure".to_string()));
		}
		self.sent_media
			.lock()
			.push((recipient.to_string(), media.filename.clone(), caption.map(str::to_string)));
		Ok(format!("msg-{}", self.next_message.fetch_add(1, Ordering::SeqCst)))
	}

	async fn connectivity_state(&self) -> Result<String, ClientError> {
		self.conn_state.lock().clone().map_err(ClientError::Protocol)
	}

	async fn liveness(&self) -> Liveness {
		*self.liveness.lock()
	}

	fn identity(&self) -> Option<String> {
		self.identity.lock().clone()
	}
}
