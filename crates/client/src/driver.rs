//! Sidecar driver bridge: one child process per tenant, NDJSON over stdio.
//!
//! Requests carry a correlation id and are answered by `{id, ok, result|error}`
//! lines; unsolicited `{event, data}` lines are forwarded to the session's
//! event stream. The child is killed on destroy and on drop.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{ChannelClient, ClientError, ClientEvent, ClientFactory, EventStream, Liveness, MediaUpload};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(8);
const DESTROY_TIMEOUT: Duration = Duration::from_secs(2);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawns one driver process per tenant session.
#[derive(Debug, Clone)]
pub struct DriverFactory {
	program: String,
	args: Vec<String>,
	command_timeout: Duration,
}

impl DriverFactory {
	/// Creates a factory running `program` for each tenant.
	pub fn new(program: impl Into<String>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			command_timeout: DEFAULT_COMMAND_TIMEOUT,
		}
	}

	/// Extra arguments passed before the tenant/profile arguments.
	pub fn with_args(mut self, args: Vec<String>) -> Self {
		self.args = args;
		self
	}

	pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
		self.command_timeout = timeout;
		self
	}
}

impl ClientFactory for DriverFactory {
	fn create(&self, tenant: &str, profile_dir: &Path) -> Result<(Arc<dyn ChannelClient>, EventStream), ClientError> {
		let (client, events) = DriverClient::spawn(tenant, profile_dir, &self.program, &self.args, self.command_timeout)?;
		Ok((client, events))
	}
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>;

/// One tenant's driver process with NDJSON request/response plumbing.
pub struct DriverClient {
	tenant: String,
	stdin: tokio::sync::Mutex<ChildStdin>,
	child: tokio::sync::Mutex<Option<Child>>,
	pending: Arc<PendingMap>,
	next_id: AtomicU64,
	identity: Arc<Mutex<Option<String>>>,
	command_timeout: Duration,
}

impl DriverClient {
	/// Spawns the driver child and wires its stdout/stderr pumps.
	pub fn spawn(
		tenant: &str,
		profile_dir: &Path,
		program: &str,
		args: &[String],
		command_timeout: Duration,
	) -> Result<(Arc<Self>, EventStream), ClientError> {
		let mut child = Command::new(program)
			.args(args)
			.arg("--tenant")
			.arg(tenant)
			.arg("--profile")
			.arg(profile_dir)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;

		let stdin = child.stdin.take().ok_or_else(|| ClientError::Protocol("driver stdin unavailable".to_string()))?;
		let stdout = child.stdout.take().ok_or_else(|| ClientError::Protocol("driver stdout unavailable".to_string()))?;
		let stderr = child.stderr.take();

		let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
		let identity = Arc::new(Mutex::new(None));

		let client = Arc::new(Self {
			tenant: tenant.to_string(),
			stdin: tokio::sync::Mutex::new(stdin),
			child: tokio::sync::Mutex::new(Some(child)),
			pending: Arc::clone(&pending),
			next_id: AtomicU64::new(1),
			identity: Arc::clone(&identity),
			command_timeout,
		});

		tokio::spawn(read_stdout(tenant.to_string(), stdout, pending, identity, events_tx));
		if let Some(stderr) = stderr {
			tokio::spawn(read_stderr(tenant.to_string(), stderr));
		}

		Ok((client, events_rx))
	}

	async fn request(&self, op: &str, params: Value) -> Result<Value, ClientError> {
		self.request_with_timeout(op, params, self.command_timeout).await
	}

	async fn request_with_timeout(&self, op: &str, params: Value, timeout: Duration) -> Result<Value, ClientError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);

		let line = json!({ "id": id, "op": op, "params": params }).to_string();
		{
			let mut stdin = self.stdin.lock().await;
			let write = async {
				stdin.write_all(line.as_bytes()).await?;
				stdin.write_all(b"\n").await?;
				stdin.flush().await
			};
			if let Err(err) = write.await {
				self.pending.lock().remove(&id);
				return Err(ClientError::Io(err));
			}
		}

		match tokio::time::timeout(timeout, rx).await {
			Err(_) => {
				self.pending.lock().remove(&id);
				debug!(target = "gate.client", tenant = %self.tenant, op, "driver command timed out");
				Err(ClientError::Timeout)
			}
			Ok(Err(_)) => Err(ClientError::Closed),
			Ok(Ok(Ok(value))) => Ok(value),
			Ok(Ok(Err(message))) => Err(classify_driver_error(message)),
		}
	}
}

#[async_trait]
impl ChannelClient for DriverClient {
	async fn initialize(&self) -> Result<(), ClientError> {
		self.request("init", json!({})).await.map(|_| ())
	}

	async fn destroy(&self) -> Result<(), ClientError> {
		let _ = self.request_with_timeout("destroy", json!({}), DESTROY_TIMEOUT).await;
		if let Some(mut child) = self.child.lock().await.take() {
			let _ = child.start_kill();
			let _ = child.wait().await;
		}
		Ok(())
	}

	async fn send_text(&self, recipient: &str, text: &str) -> Result<String, ClientError> {
		let result = self.request("sendText", json!({ "to": recipient, "text": text })).await?;
		message_id(&result)
	}

	async fn send_media(&self, recipient: &str, media: &MediaUpload, caption: Option<&str>) -> Result<String, ClientError> {
		let result = self
			.request(
				"sendMedia",
				json!({
					"to": recipient,
					"mime": media.mime,
					"filename": media.filename,
					"bytesB64": BASE64.encode(&media.bytes),
					"caption": caption,
				}),
			)
			.await?;
		message_id(&result)
	}

	async fn connectivity_state(&self) -> Result<String, ClientError> {
		let result = self.request("state", json!({})).await?;
		result["state"]
			.as_str()
			.map(str::to_string)
			.ok_or_else(|| ClientError::Protocol("state response missing state field".to_string()))
	}

	async fn liveness(&self) -> Liveness {
		match self.request_with_timeout("health", json!({}), LIVENESS_TIMEOUT).await {
			Ok(value) => Liveness {
				connected: value["connected"].as_bool().unwrap_or(false),
				page_open: value["pageOpen"].as_bool().unwrap_or(false),
			},
			Err(_) => Liveness { connected: false, page_open: false },
		}
	}

	fn identity(&self) -> Option<String> {
		self.identity.lock().clone()
	}
}

/// One NDJSON line from the driver: a response or an event.
#[derive(Debug, Deserialize)]
struct WireLine {
	id: Option<u64>,
	ok: Option<bool>,
	result: Option<Value>,
	error: Option<String>,
	event: Option<String>,
	data: Option<Value>,
}

async fn read_stdout(
	tenant: String,
	stdout: tokio::process::ChildStdout,
	pending: Arc<PendingMap>,
	identity: Arc<Mutex<Option<String>>>,
	events: mpsc::Sender<ClientEvent>,
) {
	let mut lines = BufReader::new(stdout).lines();
	loop {
		let line = match lines.next_line().await {
			Ok(Some(line)) => line,
			Ok(None) | Err(_) => break,
		};
		if line.trim().is_empty() {
			continue;
		}
		let wire: WireLine = match serde_json::from_str(&line) {
			Ok(wire) => wire,
			Err(err) => {
				warn!(target = "gate.client", tenant = %tenant, error = %err, "unparseable driver line");
				continue;
			}
		};

		if let Some(id) = wire.id {
			let outcome = if wire.ok == Some(false) || wire.error.is_some() {
				Err(wire.error.unwrap_or_else(|| "driver reported failure".to_string()))
			} else {
				Ok(wire.result.unwrap_or(Value::Null))
			};
			if let Some(tx) = pending.lock().remove(&id) {
				let _ = tx.send(outcome);
			}
			continue;
		}

		if let Some(name) = wire.event.as_deref() {
			let data = wire.data.unwrap_or(Value::Null);
			if let Some(event) = translate_event(name, data, &identity) {
				let _ = events.send(event).await;
			} else {
				debug!(target = "gate.client", tenant = %tenant, event = name, "ignoring unknown driver event");
			}
		}
	}

	// Pipe closed: fail whatever is still waiting.
	for (_, tx) in pending.lock().drain() {
		let _ = tx.send(Err("driver connection closed".to_string()));
	}
	debug!(target = "gate.client", tenant = %tenant, "driver stdout closed");
}

async fn read_stderr(tenant: String, stderr: tokio::process::ChildStderr) {
	let mut lines = BufReader::new(stderr).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		debug!(target = "gate.client", tenant = %tenant, "driver: {line}");
	}
}

fn translate_event(name: &str, data: Value, identity: &Mutex<Option<String>>) -> Option<ClientEvent> {
	match name {
		"qr" => data["code"].as_str().map(|code| ClientEvent::QrIssued { code: code.to_string() }),
		"authenticated" => Some(ClientEvent::Authenticated),
		"auth_failure" => Some(ClientEvent::AuthFailure { reason: string_field(&data, "reason") }),
		"ready" => {
			if let Some(id) = data["id"].as_str() {
				*identity.lock() = Some(id.to_string());
			}
			Some(ClientEvent::Ready)
		}
		"disconnected" => Some(ClientEvent::Disconnected { reason: string_field(&data, "reason") }),
		"state" => data["state"].as_str().map(|state| ClientEvent::StateChanged { state: state.to_string() }),
		"message" => serde_json::from_value(data).ok().map(ClientEvent::MessageReceived),
		_ => None,
	}
}

fn string_field(data: &Value, field: &str) -> String {
	data[field].as_str().unwrap_or("unknown").to_string()
}

fn message_id(result: &Value) -> Result<String, ClientError> {
	result["messageId"]
		.as_str()
		.map(str::to_string)
		.ok_or_else(|| ClientError::Protocol("send response missing messageId".to_string()))
}

fn classify_driver_error(message: String) -> ClientError {
	let lowered = message.to_lowercase();
	if lowered.contains("singleton") || lowered.contains("profile is in use") {
		ClientError::Singleton(message)
	} else {
		ClientError::Protocol(message)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wire_line_parses_response_and_event_shapes() {
		let response: WireLine = serde_json::from_str(r#"{"id":7,"ok":true,"result":{"messageId":"m1"}}"#).unwrap();
		assert_eq!(response.id, Some(7));
		assert_eq!(response.result.unwrap()["messageId"], "m1");

		let event: WireLine = serde_json::from_str(r#"{"event":"qr","data":{"code":"ABC"}}"#).unwrap();
		assert_eq!(event.event.as_deref(), Some("qr"));
		assert!(event.id.is_none());
	}

	#[test]
	fn translate_event_covers_lifecycle_variants() {
		let identity = Mutex::new(None);

		let qr = translate_event("qr", serde_json::json!({"code": "ABC"}), &identity).unwrap();
		assert_eq!(qr, ClientEvent::QrIssued { code: "ABC".to_string() });

		let ready = translate_event("ready", serde_json::json!({"id": "79161234567"}), &identity).unwrap();
		assert_eq!(ready, ClientEvent::Ready);
		assert_eq!(identity.lock().as_deref(), Some("79161234567"));

		let disconnected = translate_event("disconnected", serde_json::json!({"reason": "logout"}), &identity).unwrap();
		assert_eq!(disconnected, ClientEvent::Disconnected { reason: "logout".to_string() });

		assert!(translate_event("unknown-event", Value::Null, &identity).is_none());
	}

	#[test]
	fn translate_event_parses_inbound_message() {
		let identity = Mutex::new(None);
		let data = serde_json::json!({
			"id": "msg-1",
			"from": "79161234567@c.us",
			"text": "hi",
			"media": [{"mime": "image/png", "url": "https://example.test/a.png"}]
		});
		let Some(ClientEvent::MessageReceived(message)) = translate_event("message", data, &identity) else {
			panic!("expected message event");
		};
		assert_eq!(message.id, "msg-1");
		assert_eq!(message.media.len(), 1);
		assert_eq!(message.media[0].mime, "image/png");
	}

	#[test]
	fn driver_errors_classify_singleton_conflicts() {
		assert!(matches!(
			classify_driver_error("SingletonLock held by pid 4242".to_string()),
			ClientError::Singleton(_)
		));
		assert!(matches!(
			classify_driver_error("the profile is in use by another instance".to_string()),
			ClientError::Singleton(_)
		));
		assert!(matches!(classify_driver_error("page crashed".to_string()), ClientError::Protocol(_)));
	}
}
