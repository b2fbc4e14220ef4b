//! Gateway binary: env config, tracing init, background sweeps, HTTP serve.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use msgate::SessionManager;
use msgate_client::DriverFactory;
use msgate_server::config::ServerConfig;
use msgate_server::routes::{self, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let cfg = ServerConfig::parse();
	let factory = Arc::new(DriverFactory::new(cfg.driver_cmd.clone()));
	let manager = SessionManager::new(cfg.orchestrator(), factory).context("failed to build session manager")?;
	manager.spawn_background();

	let state = AppState {
		manager,
		api_token: cfg.api_token.clone(),
	};
	let listener = tokio::net::TcpListener::bind(&cfg.bind)
		.await
		.with_context(|| format!("failed to bind {}", cfg.bind))?;
	info!(target = "gate.http", addr = %cfg.bind, "gateway listening");
	axum::serve(listener, routes::router(state)).await?;
	Ok(())
}
