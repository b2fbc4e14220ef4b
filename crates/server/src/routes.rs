//! HTTP routing for the gateway.
//!
//! Thin translation layer: every endpoint authorizes, validates the tenant
//! path segment, and delegates to the session manager. Orchestration errors
//! map to structured `{error, detail}` responses.

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use msgate::{GateError, SendRequest, SessionManager};
use serde::Deserialize;
use serde_json::json;

use crate::metrics::render_metrics;

#[derive(Clone)]
pub struct AppState {
	pub manager: SessionManager,
	pub api_token: Option<String>,
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.route("/metrics", get(metrics))
		.route("/session/{tenant}/start", post(start))
		.route("/session/{tenant}/status", get(status))
		.route("/session/{tenant}/send", post(send))
		.route("/session/{tenant}/reset", post(reset))
		.route("/session/{tenant}/qr", get(qr_json))
		.route("/session/{tenant}/qr.svg", get(qr_svg))
		.route("/session/{tenant}/qr.png", get(qr_png))
		.with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
	#[serde(default)]
	webhook_url: Option<String>,
}

async fn healthz() -> Response {
	Json(json!({ "ok": true })).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
	let body = render_metrics(&state.manager.counters());
	([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn start(State(state): State<AppState>, Path(tenant): Path<String>, headers: HeaderMap, body: Option<Json<StartBody>>) -> Response {
	if let Err(denied) = guard(&state, &headers, &tenant) {
		return denied;
	}
	let webhook_url = body.and_then(|Json(body)| body.webhook_url);
	match state.manager.ensure(&tenant, webhook_url).await {
		Ok(snapshot) => Json(snapshot).into_response(),
		Err(err) => error_response(err),
	}
}

async fn status(State(state): State<AppState>, Path(tenant): Path<String>, headers: HeaderMap) -> Response {
	if let Err(denied) = guard(&state, &headers, &tenant) {
		return denied;
	}
	match state.manager.status(&tenant) {
		Ok(snapshot) => Json(snapshot).into_response(),
		Err(err) => error_response(err),
	}
}

async fn send(State(state): State<AppState>, Path(tenant): Path<String>, headers: HeaderMap, body: Json<SendRequest>) -> Response {
	if let Err(denied) = guard(&state, &headers, &tenant) {
		return denied;
	}
	match state.manager.send(&tenant, body.0).await {
		Ok(receipt) => Json(receipt).into_response(),
		Err(err) => error_response(err),
	}
}

async fn reset(State(state): State<AppState>, Path(tenant): Path<String>, headers: HeaderMap, body: Option<Json<StartBody>>) -> Response {
	if let Err(denied) = guard(&state, &headers, &tenant) {
		return denied;
	}
	let webhook_url = body.and_then(|Json(body)| body.webhook_url);
	match state.manager.reset(&tenant, webhook_url).await {
		Ok(snapshot) => Json(snapshot).into_response(),
		Err(err) => error_response(err),
	}
}

async fn qr_json(State(state): State<AppState>, Path(tenant): Path<String>, headers: HeaderMap) -> Response {
	if let Err(denied) = guard(&state, &headers, &tenant) {
		return denied;
	}
	match state.manager.qr_for(&tenant) {
		Some(artifact) => Json(artifact).into_response(),
		None => not_found("no_qr"),
	}
}

async fn qr_svg(State(state): State<AppState>, Path(tenant): Path<String>, headers: HeaderMap) -> Response {
	if let Err(denied) = guard(&state, &headers, &tenant) {
		return denied;
	}
	match state.manager.qr_for(&tenant) {
		Some(artifact) => ([(header::CONTENT_TYPE, "image/svg+xml")], artifact.svg).into_response(),
		None => not_found("no_qr"),
	}
}

async fn qr_png(State(state): State<AppState>, Path(tenant): Path<String>, headers: HeaderMap) -> Response {
	if let Err(denied) = guard(&state, &headers, &tenant) {
		return denied;
	}
	let Some(artifact) = state.manager.qr_for(&tenant) else {
		return not_found("no_qr");
	};
	match BASE64.decode(&artifact.png_b64) {
		Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
		Err(_) => (
			StatusCode::INTERNAL_SERVER_ERROR,
			Json(json!({ "error": "corrupt_qr_artifact" })),
		)
			.into_response(),
	}
}

fn guard(state: &AppState, headers: &HeaderMap, tenant: &str) -> Result<(), Response> {
	authorize(state, headers)?;
	validate_tenant(tenant)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
	let Some(expected) = state.api_token.as_deref() else {
		return Ok(());
	};
	let presented = headers
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "));
	if presented == Some(expected) {
		Ok(())
	} else {
		Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response())
	}
}

/// Tenant ids become path segments under the state root; restrict them to a
/// safe alphabet.
fn validate_tenant(tenant: &str) -> Result<(), Response> {
	let valid = !tenant.is_empty()
		&& tenant.len() <= 64
		&& tenant.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
	if valid {
		Ok(())
	} else {
		Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_tenant" }))).into_response())
	}
}

fn not_found(label: &str) -> Response {
	(StatusCode::NOT_FOUND, Json(json!({ "error": label }))).into_response()
}

fn error_response(err: GateError) -> Response {
	let (status, label) = match &err {
		GateError::NoSession(_) => (StatusCode::NOT_FOUND, "no_session"),
		GateError::InvalidRecipient(_) => (StatusCode::BAD_REQUEST, "invalid_recipient"),
		GateError::MediaFetchFailed { .. } => (StatusCode::BAD_GATEWAY, "media_fetch_failed"),
		GateError::Unauthorized => (StatusCode::BAD_GATEWAY, "unauthorized_upstream"),
		GateError::TokenUnavailable(_) => (StatusCode::BAD_GATEWAY, "token_unavailable"),
		GateError::Transient(_) => (StatusCode::BAD_GATEWAY, "transient_upstream"),
		GateError::TerminalAuthFailure(_) => (StatusCode::CONFLICT, "auth_failure"),
		GateError::LockConflict(_) => (StatusCode::CONFLICT, "lock_conflict"),
		_ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
	};
	(status, Json(json!({ "error": label, "detail": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tenant_validation_rejects_path_tricks() {
		assert!(validate_tenant("42").is_ok());
		assert!(validate_tenant("acme-prod_7").is_ok());
		assert!(validate_tenant("").is_err());
		assert!(validate_tenant("../etc").is_err());
		assert!(validate_tenant("a/b").is_err());
		assert!(validate_tenant(&"x".repeat(65)).is_err());
	}
}
