//! Admin Surface (C10): read-only (plus one destructive op) operational
//! view over the Document Registry. Mirrors the reference admin handlers'
//! `State(app) -> ClResult<Json<_>>` shape, but is mounted on its own
//! listener and is never gated by the Auth Gate — it is meant to sit
//! behind network-level access control, not application auth.

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use collab_types::prelude::*;
use serde::Serialize;

use crate::app::App;

pub fn router() -> Router<App> {
	Router::new()
		.route("/stats", get(stats))
		.route("/documents", get(list_documents))
		.route("/documents/{document_id}", get(document_info))
		.route("/documents/{document_id}", delete(force_remove))
}

#[derive(Debug, Serialize)]
struct BusStatsView {
	sent: u64,
	received: u64,
	errors: u64,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
	hubs: usize,
	clients: usize,
	bytes: usize,
	bus: BusStatsView,
	instance_id: String,
}

async fn stats(State(app): State<App>) -> Json<StatsResponse> {
	let documents = app.registry.list().await;
	let hubs = documents.len();
	let clients = documents.iter().map(|(_, stats)| stats.clients).sum();
	let bytes = documents.iter().map(|(_, stats)| stats.size_bytes).sum();
	let bus = app.registry.bus_stats();

	Json(StatsResponse {
		hubs,
		clients,
		bytes,
		bus: BusStatsView { sent: bus.sent, received: bus.received, errors: bus.errors },
		instance_id: app.settings.instance_id.as_str().to_string(),
	})
}

#[derive(Debug, Serialize)]
struct DocumentView {
	document_id: String,
	clients: usize,
	awareness_entries: usize,
	size_bytes: usize,
}

async fn list_documents(State(app): State<App>) -> Json<Vec<DocumentView>> {
	let documents = app
		.registry
		.list()
		.await
		.into_iter()
		.map(|(id, stats)| DocumentView {
			document_id: id.as_str().to_string(),
			clients: stats.clients,
			awareness_entries: stats.awareness_entries,
			size_bytes: stats.size_bytes,
		})
		.collect();
	Json(documents)
}

async fn document_info(State(app): State<App>, Path(raw_document_id): Path<String>) -> ClResult<Json<DocumentView>> {
	let document_id = DocumentId::parse(&raw_document_id);
	app.registry
		.list()
		.await
		.into_iter()
		.find(|(id, _)| id == &document_id)
		.map(|(id, stats)| {
			Json(DocumentView { document_id: id.as_str().to_string(), clients: stats.clients, awareness_entries: stats.awareness_entries, size_bytes: stats.size_bytes })
		})
		.ok_or(Error::NotFound)
}

/// Evicts an idle document's Hub from this instance. Refuses (`ErrActiveClients`)
/// if any client is still attached, per §4.6 — operators should disconnect
/// clients first, not the other way around.
async fn force_remove(State(app): State<App>, Path(raw_document_id): Path<String>) -> ClResult<()> {
	let document_id = DocumentId::parse(&raw_document_id);
	app.registry.force_remove(&document_id).await
}

// vim: ts=4
