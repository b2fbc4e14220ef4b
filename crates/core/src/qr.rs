//! Pairing-artifact rendering, caching, and crash-safe persistence.
//!
//! The process keeps a single most-recent QR snapshot across all tenants.
//! Every issuance overwrites it in memory and on disk; after a restart the
//! persisted file serves reads until a fresh code arrives.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use qrcode::QrCode;
use qrcode::render::svg;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::qr_snapshot_path;
use crate::error::{GateError, Result};
use crate::session::QrArtifact;

const QR_SNAPSHOT_SCHEMA_VERSION: u32 = 1;
const QR_MIN_DIMENSION: u32 = 256;

fn qr_snapshot_schema_version() -> u32 {
	QR_SNAPSHOT_SCHEMA_VERSION
}

/// Persisted form of the most recent pairing artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrSnapshot {
	#[serde(default = "qr_snapshot_schema_version")]
	pub schema_version: u32,
	pub tenant: String,
	pub ts_ms: u64,
	pub id: String,
	pub text: String,
	pub svg: String,
	pub png_b64: String,
}

impl QrSnapshot {
	fn artifact(&self) -> QrArtifact {
		QrArtifact {
			id: self.id.clone(),
			text: self.text.clone(),
			svg: self.svg.clone(),
			png_b64: self.png_b64.clone(),
		}
	}
}

/// Global QR cache backed by one JSON file under the state root.
pub struct QrStore {
	path: PathBuf,
	cache: Mutex<Option<QrSnapshot>>,
}

impl QrStore {
	pub fn new(state_root: &Path) -> Self {
		Self {
			path: qr_snapshot_path(state_root),
			cache: Mutex::new(None),
		}
	}

	/// Renders and records a freshly issued code for `tenant`, overwriting
	/// the global snapshot. Persistence is synchronous; a write failure is
	/// logged but does not fail the issuance.
	pub fn record(&self, tenant: &str, code: &str, id: Option<String>) -> Result<QrArtifact> {
		let rendered = QrCode::new(code.as_bytes()).map_err(|err| GateError::QrRender(err.to_string()))?;
		let svg = rendered
			.render::<svg::Color>()
			.min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
			.build();
		let raster = rendered
			.render::<image::Luma<u8>>()
			.min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
			.build();
		let mut png = Vec::new();
		image::DynamicImage::ImageLuma8(raster)
			.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
			.map_err(|err| GateError::QrRender(err.to_string()))?;

		let ts_ms = now_ms();
		let snapshot = QrSnapshot {
			schema_version: QR_SNAPSHOT_SCHEMA_VERSION,
			tenant: tenant.to_string(),
			ts_ms,
			id: id.unwrap_or_else(|| ts_ms.to_string()),
			text: code.to_string(),
			svg,
			png_b64: BASE64.encode(&png),
		};

		if let Err(err) = self.persist(&snapshot) {
			warn!(target = "gate.qr", tenant, error = %err, "failed to persist qr snapshot");
		}
		let artifact = snapshot.artifact();
		*self.cache.lock() = Some(snapshot);
		Ok(artifact)
	}

	/// Current snapshot: memory first, then the persisted file.
	pub fn snapshot(&self) -> Option<QrSnapshot> {
		let mut cache = self.cache.lock();
		if cache.is_none() {
			*cache = self.load();
		}
		cache.clone()
	}

	/// Snapshot only when it belongs to `tenant` — the cache is global, so
	/// readers must not trust another tenant's code.
	pub fn artifact_for(&self, tenant: &str) -> Option<QrArtifact> {
		self.snapshot().filter(|snapshot| snapshot.tenant == tenant).map(|snapshot| snapshot.artifact())
	}

	fn persist(&self, snapshot: &QrSnapshot) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let json = serde_json::to_string_pretty(snapshot)?;
		std::fs::write(&self.path, json)?;
		Ok(())
	}

	fn load(&self) -> Option<QrSnapshot> {
		let loaded = std::fs::read_to_string(&self.path)
			.ok()
			.and_then(|content| serde_json::from_str(&content).ok());
		if loaded.is_some() {
			debug!(target = "gate.qr", path = %self.path.display(), "loaded persisted qr snapshot");
		}
		loaded
	}
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn record_produces_both_renderings() {
		let temp = TempDir::new().unwrap();
		let store = QrStore::new(temp.path());

		let artifact = store.record("42", "PAIR-CODE", None).unwrap();
		assert!(artifact.svg.contains("<svg"));
		assert!(!artifact.id.is_empty());
		assert!(BASE64.decode(&artifact.png_b64).unwrap().starts_with(&[0x89, b'P', b'N', b'G']));
	}

	#[test]
	fn snapshot_survives_process_restart() {
		let temp = TempDir::new().unwrap();
		let artifact = QrStore::new(temp.path()).record("42", "PAIR-CODE", Some("qr-1".to_string())).unwrap();

		// A fresh store over the same root lazily reloads the file.
		let reopened = QrStore::new(temp.path());
		let snapshot = reopened.snapshot().unwrap();
		assert_eq!(snapshot.tenant, "42");
		assert_eq!(snapshot.id, artifact.id);
		assert_eq!(reopened.artifact_for("42").unwrap().id, "qr-1");
	}

	#[test]
	fn any_tenant_overwrites_the_global_snapshot() {
		let temp = TempDir::new().unwrap();
		let store = QrStore::new(temp.path());
		store.record("42", "FIRST", Some("a".to_string())).unwrap();
		store.record("7", "SECOND", Some("b".to_string())).unwrap();

		assert_eq!(store.snapshot().unwrap().tenant, "7");
		assert!(store.artifact_for("42").is_none());
		assert_eq!(store.artifact_for("7").unwrap().id, "b");
	}
}
