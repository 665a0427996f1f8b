//! Settings & Bootstrap (C9): the thin process entrypoint. Loads
//! configuration, wires the Bus/Registry/Auth Gate into one `AppState`, and
//! serves the collaboration and (optional) admin listeners side by side,
//! mirroring the reference's `Builder::run` wiring order.

use std::sync::Arc;

use collab_bus::{Bus, BusConfig, RedisBus};
use collab_server::app::{App, AppState};
use collab_server::auth::{AuthGate, JwtAuthGate};
use collab_server::registry::Registry;
use collab_server::{admin, session};
use collab_types::prelude::*;
use collab_types::Settings;

#[tokio::main]
async fn main() -> ClResult<()> {
	let settings = Settings::from_env()?;

	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_target(false).init();

	info!("starting collab-server on {} (instance {})", settings.listen_addr, settings.instance_id);

	let bus_config = BusConfig {
		prefix: settings.bus_prefix.clone(),
		chunk_threshold: settings.bus_chunk_threshold,
		chunk_reassembly_timeout: settings.bus_chunk_reassembly_timeout,
	};
	let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(&settings.redis_url, bus_config).await?);

	let registry = Arc::new(Registry::new(
		bus.clone(),
		settings.instance_id.clone(),
		settings.max_hubs,
		settings.max_clients_per_hub,
		settings.idle_grace,
		settings.drain_deadline,
	));

	let auth_gate: Arc<dyn AuthGate> = Arc::new(JwtAuthGate::new(&settings.jwt_secret, settings.jwt_algorithm, settings.default_open_policy));

	let admin_listen_addr = settings.admin_listen_addr;
	let state: App = Arc::new(AppState { settings: Arc::new(settings), registry, auth_gate, bus });

	// One shared shutdown latch: the signal-waiter task below drains the
	// Registry exactly once, then flips this so both listeners' graceful
	// shutdown futures resolve together.
	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	let drain_state = state.clone();
	tokio::spawn(async move {
		wait_for_signal().await;
		info!("shutdown signal received, draining connections");
		drain_state.registry.drain().await;
		let _ = shutdown_tx.send(true);
	});

	let collab_router = session::router().with_state(state.clone());
	let collab_listener = tokio::net::TcpListener::bind(state.settings.listen_addr).await?;
	info!("collaboration endpoint listening on {}", state.settings.listen_addr);
	let mut collab_shutdown = shutdown_rx.clone();
	let collab_server = tokio::spawn(async move {
		axum::serve(collab_listener, collab_router)
			.with_graceful_shutdown(async move {
				let _ = collab_shutdown.wait_for(|&drained| drained).await;
			})
			.await
	});

	let admin_server = match admin_listen_addr {
		Some(addr) => {
			let admin_router = admin::router().with_state(state.clone());
			let admin_listener = tokio::net::TcpListener::bind(addr).await?;
			info!("admin surface listening on {addr}");
			let mut admin_shutdown = shutdown_rx.clone();
			Some(tokio::spawn(async move {
				axum::serve(admin_listener, admin_router)
					.with_graceful_shutdown(async move {
						let _ = admin_shutdown.wait_for(|&drained| drained).await;
					})
					.await
			}))
		}
		None => None,
	};

	if let Some(admin_server) = admin_server {
		let (collab_result, admin_result) = tokio::join!(collab_server, admin_server);
		collab_result.map_err(|e| Error::Internal(e.to_string()))?.map_err(Error::from)?;
		admin_result.map_err(|e| Error::Internal(e.to_string()))?.map_err(Error::from)?;
	} else {
		collab_server.await.map_err(|e| Error::Internal(e.to_string()))?.map_err(Error::from)?;
	}

	Ok(())
}

/// Resolves once SIGINT or SIGTERM arrives. The caller then runs
/// `Registry.Drain` before letting `axum::serve`'s graceful shutdown stop
/// accepting new connections and finish in-flight ones.
async fn wait_for_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				warn!("failed to install SIGTERM handler: {e}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {}
		() = terminate => {}
	}
}

// vim: ts=4
