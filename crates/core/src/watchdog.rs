//! Periodic liveness sweep over tenant sessions.
//!
//! The client's own event stream cannot be trusted to always fire a terminal
//! event; time-based staleness is the fallback signal. Each sweep checks
//! basic liveness for every session, actively probes ready sessions at a
//! slower cadence, and rebuilds stalled bootstraps in place.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::session::manager::{SessionManager, TenantEntry};

/// Connectivity values that need no intervention.
const HEALTHY_STATES: &[&str] = &["connected"];
/// Transient value tolerated until `opening_timeout`.
const OPENING_STATE: &str = "opening";

pub(crate) fn spawn(manager: SessionManager) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(manager.config().watchdog_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			for entry in manager.entries() {
				check_entry(&manager, &entry).await;
			}
		}
	})
}

async fn check_entry(manager: &SessionManager, entry: &Arc<TenantEntry>) {
	if entry.reset_in_progress.load(Ordering::SeqCst) {
		return;
	}
	let Some(client) = entry.client.read().clone() else {
		return;
	};
	let cfg = manager.config();

	let liveness = client.liveness().await;
	if !liveness.is_alive() {
		manager.schedule_reset(&entry.tenant, "browser_disconnected");
		return;
	}

	// Ready sessions get a slower active connectivity probe.
	let probe_due = {
		let mut core = entry.core.lock();
		if core.ready && core.last_probe.is_none_or(|at| at.elapsed() >= cfg.probe_interval) {
			core.last_probe = Some(Instant::now());
			true
		} else {
			false
		}
	};
	if probe_due {
		match client.connectivity_state().await {
			Ok(state) => {
				let lowered = state.to_lowercase();
				let unchanged_for = entry.core.lock().observe_conn_state(&lowered);
				if lowered == OPENING_STATE {
					if unchanged_for > cfg.opening_timeout {
						manager.schedule_reset(&entry.tenant, "opening_timeout");
						return;
					}
				} else if !HEALTHY_STATES.contains(&lowered.as_str()) {
					manager.schedule_reset(&entry.tenant, "unhealthy_state");
					return;
				}
			}
			Err(err) => {
				debug!(target = "gate.watchdog", tenant = %entry.tenant, error = %err, "connectivity probe failed");
				manager.schedule_reset(&entry.tenant, "probe_error");
				return;
			}
		}
	}

	// A session stuck before pairing without QR progress is rebuilt in place.
	let stuck = entry.core.lock().is_idle_stuck(cfg.idle_threshold);
	if stuck {
		manager.soft_reinit(entry).await;
	}
}
