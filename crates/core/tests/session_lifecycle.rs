use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use msgate::{GateError, OrchestratorConfig, SendRequest, SessionManager};
use msgate_client::ClientEvent;
use msgate_client::testing::ScriptedFactory;
use tempfile::TempDir;

fn test_config(root: &Path) -> OrchestratorConfig {
	OrchestratorConfig {
		state_root: root.to_path_buf(),
		..OrchestratorConfig::default()
	}
}

fn manager_with(cfg: OrchestratorConfig) -> (SessionManager, Arc<ScriptedFactory>) {
	let factory = ScriptedFactory::new();
	let manager = SessionManager::new(cfg, factory.clone()).expect("manager should build");
	(manager, factory)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
	for _ in 0..300 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn concurrent_ensure_creates_a_single_session() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));

	let mut joins = Vec::new();
	for _ in 0..8 {
		let manager = manager.clone();
		joins.push(tokio::spawn(async move { manager.ensure("42", None).await }));
	}
	for join in joins {
		join.await.unwrap().expect("ensure should succeed");
	}

	assert_eq!(factory.created(), 1);
	assert_eq!(manager.tenants(), vec!["42".to_string()]);
}

#[tokio::test]
async fn qr_event_then_ready_clears_artifact() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));

	let snapshot = manager.ensure("42", None).await.unwrap();
	assert_eq!(snapshot.state, "init");
	assert!(!snapshot.ready);

	let handle = factory.latest().unwrap();
	handle.events.send(ClientEvent::QrIssued { code: "ABC".to_string() }).await.unwrap();
	wait_until("qr state", || manager.status("42").is_ok_and(|s| s.state == "qr")).await;

	let status = manager.status("42").unwrap();
	assert!(status.has_qr);
	let qr_id = status.qr_id.expect("qr id should be assigned");
	assert!(!qr_id.is_empty());
	assert_eq!(manager.qr_for("42").unwrap().id, qr_id);
	assert_eq!(manager.qr_for("42").unwrap().text, "ABC");

	handle.events.send(ClientEvent::Ready).await.unwrap();
	wait_until("ready state", || manager.status("42").is_ok_and(|s| s.ready)).await;

	let status = manager.status("42").unwrap();
	assert!(!status.has_qr);
	assert!(status.qr_id.is_none());
	assert!(manager.qr_for("42").is_none(), "a ready session serves no pairing code");
}

#[tokio::test]
async fn reissued_qr_replaces_artifact_id() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	let handle = factory.latest().unwrap();
	handle
		.events
		.send(ClientEvent::QrIssued { code: "FIRST".to_string() })
		.await
		.unwrap();
	wait_until("first qr", || manager.qr_for("42").is_some()).await;
	let first = manager.qr_for("42").unwrap();

	handle
		.events
		.send(ClientEvent::QrIssued { code: "SECOND".to_string() })
		.await
		.unwrap();
	wait_until("second qr", || manager.qr_for("42").is_some_and(|qr| qr.text == "SECOND")).await;
	assert_ne!(manager.qr_for("42").unwrap().text, first.text);
}

#[tokio::test]
async fn send_normalizes_recipient_and_delivers_text() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	let handle = factory.latest().unwrap();
	handle.client.set_identity("79160000000");
	handle.events.send(ClientEvent::Ready).await.unwrap();
	wait_until("ready", || manager.status("42").is_ok_and(|s| s.ready)).await;

	let receipt = manager
		.send(
			"42",
			SendRequest {
				to: "+7 916 123-45-67".to_string(),
				text: Some("hi".to_string()),
				attachments: Vec::new(),
			},
		)
		.await
		.unwrap();

	assert_eq!(receipt.recipient, "79161234567@c.us");
	assert_eq!(receipt.message_ids.len(), 1);
	assert_eq!(handle.client.sent_texts(), vec![("79161234567@c.us".to_string(), "hi".to_string())]);
}

#[tokio::test]
async fn send_me_sentinel_targets_own_identity() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	let handle = factory.latest().unwrap();
	handle.client.set_identity("79160000000");

	let receipt = manager
		.send(
			"42",
			SendRequest {
				to: "me".to_string(),
				text: Some("note to self".to_string()),
				attachments: Vec::new(),
			},
		)
		.await
		.unwrap();
	assert_eq!(receipt.recipient, "79160000000@c.us");
}

#[tokio::test]
async fn first_attachment_carries_the_caption() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let files = axum::Router::new()
		.route("/a.png", axum::routing::get(|| async { [0x89u8, b'P', b'N', b'G'].to_vec() }))
		.route("/b.pdf", axum::routing::get(|| async { b"%PDF-".to_vec() }));
	tokio::spawn(async move {
		axum::serve(listener, files).await.unwrap();
	});

	let receipt = manager
		.send(
			"42",
			SendRequest {
				to: "79161234567".to_string(),
				text: Some("look at these".to_string()),
				attachments: vec![
					msgate::Attachment {
						url: format!("http://{addr}/a.png"),
						mime: Some("image/png".to_string()),
						filename: None,
					},
					msgate::Attachment {
						url: format!("http://{addr}/b.pdf"),
						mime: None,
						filename: Some("report.pdf".to_string()),
					},
				],
			},
		)
		.await
		.unwrap();

	assert_eq!(receipt.message_ids.len(), 2);
	let handle = factory.latest().unwrap();
	let media = handle.client.sent_media();
	assert_eq!(media.len(), 2);
	assert_eq!(media[0], ("79161234567@c.us".to_string(), "a.png".to_string(), Some("look at these".to_string())));
	assert_eq!(media[1], ("79161234567@c.us".to_string(), "report.pdf".to_string(), None));
	// The caption rode on the first attachment; no separate text message.
	assert!(handle.client.sent_texts().is_empty());
}

#[tokio::test]
async fn unreachable_attachment_aborts_with_media_fetch_failed() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);

	let err = manager
		.send(
			"42",
			SendRequest {
				to: "79161234567".to_string(),
				text: Some("hi".to_string()),
				attachments: vec![msgate::Attachment {
					url: format!("http://127.0.0.1:{port}/gone.png"),
					mime: None,
					filename: None,
				}],
			},
		)
		.await
		.unwrap_err();

	match err {
		GateError::MediaFetchFailed { recipient, .. } => assert_eq!(recipient, "79161234567@c.us"),
		other => panic!("expected MediaFetchFailed, got {other:?}"),
	}
	assert!(factory.latest().unwrap().client.sent_media().is_empty());
}

#[tokio::test]
async fn send_without_session_fails_with_no_session() {
	let temp = TempDir::new().unwrap();
	let (manager, _factory) = manager_with(test_config(temp.path()));

	let err = manager
		.send(
			"42",
			SendRequest {
				to: "+7 916 123-45-67".to_string(),
				text: Some("hi".to_string()),
				attachments: Vec::new(),
			},
		)
		.await
		.unwrap_err();
	assert!(matches!(err, GateError::NoSession(tenant) if tenant == "42"));
}

#[tokio::test]
async fn invalid_recipient_is_rejected_before_any_client_call() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	let err = manager
		.send(
			"42",
			SendRequest {
				to: "12345".to_string(),
				text: Some("hi".to_string()),
				attachments: Vec::new(),
			},
		)
		.await
		.unwrap_err();
	assert!(matches!(err, GateError::InvalidRecipient(_)));
	assert!(factory.latest().unwrap().client.sent_texts().is_empty());
}

#[tokio::test]
async fn concurrent_resets_rebuild_exactly_one_session() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();
	assert_eq!(factory.created(), 1);

	// Polled on one task: whichever reset reaches the state-dir removal
	// first suspends there, and the other observes the in-progress guard.
	let (first, second) = tokio::join!(manager.reset("42", None), manager.reset("42", None));
	first.expect("first reset should succeed");
	second.expect("second reset should succeed");

	// One teardown, one rebuild; the loser of the guard race is a no-op.
	wait_until("rebuild settles", || manager.status("42").is_ok()).await;
	assert_eq!(factory.created(), 2);
	assert_eq!(manager.tenants(), vec!["42".to_string()]);
}

#[tokio::test]
async fn reset_deletes_tenant_state_and_preserves_webhook_override() {
	let temp = TempDir::new().unwrap();
	let cfg = test_config(temp.path());
	let tenant_dir = cfg.tenant_dir("42");
	let (manager, factory) = manager_with(cfg);

	manager.ensure("42", Some("https://partner.test/hook".to_string())).await.unwrap();
	std::fs::write(tenant_dir.join("creds.json"), b"{}").unwrap();

	let snapshot = manager.reset("42", None).await.unwrap();
	assert_eq!(factory.created(), 2);
	assert_eq!(snapshot.webhook_url.as_deref(), Some("https://partner.test/hook"));
	assert!(!tenant_dir.join("creds.json").exists(), "pairing state should be wiped");
	assert_eq!(factory.handle(0).unwrap().client.destroy_calls(), 1);
}

#[tokio::test]
async fn idle_stalled_session_is_soft_reinitialized_on_ensure() {
	let temp = TempDir::new().unwrap();
	let cfg = OrchestratorConfig {
		idle_threshold: Duration::from_millis(30),
		..test_config(temp.path())
	};
	let tenant_dir = cfg.tenant_dir("42");
	let (manager, factory) = manager_with(cfg);

	manager.ensure("42", None).await.unwrap();
	std::fs::write(tenant_dir.join("creds.json"), b"{}").unwrap();
	tokio::time::sleep(Duration::from_millis(60)).await;

	manager.ensure("42", None).await.unwrap();
	assert_eq!(factory.created(), 2, "stalled client should be rebuilt");
	assert_eq!(factory.handle(0).unwrap().client.destroy_calls(), 1);
	// Soft reinit keeps stored pairing state.
	assert!(tenant_dir.join("creds.json").exists());
}

#[tokio::test]
async fn logout_disconnect_forces_a_full_reset() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	let handle = factory.latest().unwrap();
	handle
		.events
		.send(ClientEvent::Disconnected { reason: "logout".to_string() })
		.await
		.unwrap();

	wait_until("reset rebuild", || factory.created() == 2).await;
	wait_until("fresh session", || manager.status("42").is_ok_and(|s| s.state == "init")).await;
	assert_eq!(factory.handle(0).unwrap().client.destroy_calls(), 1);
}

#[tokio::test]
async fn unpaired_state_change_forces_a_full_reset() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	factory
		.latest()
		.unwrap()
		.events
		.send(ClientEvent::StateChanged { state: "UNPAIRED".to_string() })
		.await
		.unwrap();

	wait_until("reset rebuild", || factory.created() == 2).await;
}

#[tokio::test]
async fn singleton_conflict_during_init_clears_locks_and_resets() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));

	factory.fail_next_init_with_singleton("SingletonLock held by pid 4242");
	manager.ensure("42", None).await.unwrap();

	wait_until("reset rebuild", || factory.created() == 2).await;
	wait_until("second init attempt", || {
		factory.handle(1).is_some_and(|handle| handle.client.init_calls() == 1)
	})
	.await;
}

#[tokio::test]
async fn auth_failure_is_terminal_until_external_reset() {
	let temp = TempDir::new().unwrap();
	let (manager, factory) = manager_with(test_config(temp.path()));
	manager.ensure("42", None).await.unwrap();

	factory
		.latest()
		.unwrap()
		.events
		.send(ClientEvent::AuthFailure { reason: "pairing rejected".to_string() })
		.await
		.unwrap();
	wait_until("auth failure state", || manager.status("42").is_ok_and(|s| s.state == "auth_failure")).await;

	// No self-healing for auth failures.
	tokio::time::sleep(Duration::from_millis(80)).await;
	assert_eq!(factory.created(), 1);

	manager.reset("42", None).await.unwrap();
	assert_eq!(factory.created(), 2);
	assert_eq!(manager.status("42").unwrap().state, "init");
}
