//! Session Orchestrator (C7): turns an authenticated HTTP upgrade into a
//! running client session, and the liveness half of the Framed Transport
//! (C2) — ping/pong and the per-client outbound queue cap live here because
//! both are properties of one connection, not of the Hub.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use collab_types::prelude::*;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::app::App;
use crate::auth::extract_token;
use crate::frame::Frame;
use crate::hub::CloseReason;

/// How long, after the reader task ends on its own, the writer is given to
/// flush a close frame it may already owe the client (§7) before being
/// aborted outright.
const WRITER_FLUSH_GRACE: Duration = Duration::from_millis(500);

pub fn router() -> Router<App> {
	Router::new().route("/{document_id}", get(upgrade))
}

/// Validate the credential and permission for `document_id` before handing
/// off to the WebSocket upgrade, per §6.1: a request that fails either check
/// never reaches `on_upgrade` and gets a plain HTTP error response instead.
async fn upgrade(State(app): State<App>, Path(raw_document_id): Path<String>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
	let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
	let subprotocols = requested_subprotocols(&headers);

	let Some(token) = extract_token(authorization, &subprotocols) else {
		return Error::Unauthorized.into_response();
	};

	let principal = match app.auth_gate.validate_token(&token).await {
		Ok(principal) => principal,
		Err(e) => return e.into_response(),
	};

	let document_id = DocumentId::parse(&raw_document_id);
	if !app.auth_gate.may_open(&principal, &document_id) {
		return Error::PermissionDenied.into_response();
	}

	// Echo back the auth subprotocol the client offered, if any, so
	// browsers that require a selected subprotocol accept the handshake.
	let ws = match subprotocols.iter().find(|p| p.starts_with("auth.")) {
		Some(proto) => ws.protocols([proto.clone()]),
		None => ws,
	};

	ws.on_upgrade(move |socket| run_session(socket, app, document_id, principal))
}

fn requested_subprotocols(headers: &HeaderMap) -> Vec<String> {
	headers
		.get(header::SEC_WEBSOCKET_PROTOCOL)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
		.unwrap_or_default()
}

async fn run_session(socket: WebSocket, app: App, document_id: DocumentId, principal: Principal) {
	let hub = match app.registry.get(&document_id).await {
		Ok(hub) => hub,
		Err(e) => {
			warn!("rejecting session for {document_id}: {e}");
			close_immediately(socket, &e).await;
			return;
		}
	};

	let (mut sink, stream) = socket.split();
	let (tx, rx) = mpsc::channel::<Vec<u8>>(app.settings.outbound_queue_cap);
	let (close_tx, close_rx) = watch::channel::<Option<CloseReason>>(None);

	let (client_id, step1, awareness) = match hub.register(tx.clone(), close_tx.clone()).await {
		Ok(v) => v,
		Err(e) => {
			warn!("registration rejected for {document_id}: {e}");
			close_immediately_split(sink, &e).await;
			return;
		}
	};

	if sink.send(Message::Binary(step1.into())).await.is_err() {
		hub.unregister(client_id).await;
		app.registry.release(document_id, hub).await;
		return;
	}
	if let Some(awareness) = awareness {
		if sink.send(Message::Binary(awareness.into())).await.is_err() {
			hub.unregister(client_id).await;
			app.registry.release(document_id, hub).await;
			return;
		}
	}

	info!("client {client_id} joined {document_id} as {}", principal.user_id);

	let got_pong = Arc::new(AtomicBool::new(true));
	let ping_interval = app.settings.ping_interval;

	let mut writer = tokio::spawn(writer_loop(sink, rx, close_rx, client_id, ping_interval, got_pong.clone()));
	let mut reader = tokio::spawn(reader_loop(stream, hub.clone(), tx, close_tx, client_id, got_pong));

	// The writer is the only task holding the sink, so a server-initiated
	// close (ping timeout, Hub-signaled `ErrSlowConsumer`/`ErrShutdown`, or a
	// close the reader requested after a protocol/corrupt-update error) is
	// always sent from there. If the reader finishes first, give the writer
	// a bounded grace period to flush any close frame it already owes the
	// client instead of aborting it mid-send.
	tokio::select! {
		_ = &mut reader => {
			if tokio::time::timeout(WRITER_FLUSH_GRACE, &mut writer).await.is_err() {
				writer.abort();
			}
		}
		_ = &mut writer => reader.abort(),
	}

	hub.unregister(client_id).await;
	app.registry.release(document_id.clone(), hub).await;
	info!("client {client_id} left {document_id}");
}

/// Drains the Hub-fed outbound queue, the ping clock, and the close-request
/// channel into the socket. This is the only task holding the sink, so every
/// server-initiated close — ping timeout, a Hub-signaled `ErrSlowConsumer`
/// or `ErrShutdown` (both raised via `close_rx`), or a protocol/corrupt-
/// update close the reader asked for — is actually sent from here.
async fn writer_loop(
	mut sink: futures::stream::SplitSink<WebSocket, Message>,
	mut rx: mpsc::Receiver<Vec<u8>>,
	mut close_rx: watch::Receiver<Option<CloseReason>>,
	client_id: ClientId,
	ping_interval: std::time::Duration,
	got_pong: Arc<AtomicBool>,
) {
	let mut ticker = tokio::time::interval(ping_interval);
	ticker.tick().await; // the first tick fires immediately; consume it

	loop {
		tokio::select! {
			frame = rx.recv() => {
				let Some(bytes) = frame else { break };
				if sink.send(Message::Binary(bytes.into())).await.is_err() {
					break;
				}
			}
			changed = close_rx.changed() => {
				if changed.is_err() {
					break;
				}
				let close_payload = *close_rx.borrow_and_update();
				if let Some((code, reason)) = close_payload {
					let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
				}
				break;
			}
			_ = ticker.tick() => {
				if !got_pong.swap(false, Ordering::SeqCst) {
					warn!("client {client_id} missed a ping, closing");
					let _ = sink.send(Message::Close(Some(CloseFrame { code: 1001, reason: "ping timeout".into() }))).await;
					break;
				}
				if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
					break;
				}
			}
		}
	}
	let _ = sink.close().await;
}

/// Decodes inbound frames and dispatches them to the Hub. Any reply the
/// Hub has for this client alone (a Sync/Step2 answer) is pushed back
/// through `reply_tx`, the same channel the Hub uses for fan-out. A protocol
/// or corrupt-update error requests its close code from the writer via
/// `close_tx` (§7) rather than closing the socket itself — only the writer
/// holds the sink.
async fn reader_loop(
	mut stream: futures::stream::SplitStream<WebSocket>,
	hub: Arc<crate::hub::Hub>,
	reply_tx: mpsc::Sender<Vec<u8>>,
	close_tx: watch::Sender<Option<CloseReason>>,
	client_id: ClientId,
	got_pong: Arc<AtomicBool>,
) {
	while let Some(message) = stream.next().await {
		let message = match message {
			Ok(m) => m,
			Err(e) => {
				warn!("websocket read error for client {client_id}: {e}");
				break;
			}
		};

		match message {
			Message::Binary(data) => {
				let frame = match Frame::decode(&data) {
					Ok(frame) => frame,
					Err(e) => {
						warn!("protocol error from client {client_id}: {e}");
						let _ = close_tx.send(Some(close_code_for(&e)));
						break;
					}
				};
				match frame {
					Frame::Sync(msg) => match hub.handle_sync(client_id, msg).await {
						Ok(Some(reply)) => {
							if reply_tx.send(reply).await.is_err() {
								break;
							}
						}
						Ok(None) => {}
						Err(e) => {
							warn!("sync error from client {client_id}: {e}");
							let _ = close_tx.send(Some(close_code_for(&e)));
							break;
						}
					},
					Frame::Awareness(blob) => {
						if let Err(e) = hub.handle_awareness(client_id, blob).await {
							warn!("awareness error from client {client_id}: {e}");
						}
					}
				}
			}
			Message::Pong(_) => got_pong.store(true, Ordering::SeqCst),
			Message::Close(_) => break,
			Message::Text(_) | Message::Ping(_) => {}
		}
	}
}

async fn close_immediately(socket: WebSocket, error: &Error) {
	let (sink, _stream) = socket.split();
	close_immediately_split(sink, error).await;
}

async fn close_immediately_split(mut sink: futures::stream::SplitSink<WebSocket, Message>, error: &Error) {
	let (code, reason) = close_code_for(error);
	let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
	let _ = sink.close().await;
}

/// Maps an `Error` to one of the standard WebSocket close codes of §7 —
/// 1001 (Going Away), 1002 (Protocol Error), 1003 (Unsupported Data), 1008
/// (Policy Violation) — never an ad hoc application code.
fn close_code_for(error: &Error) -> CloseReason {
	match error {
		Error::Protocol(_) => (1002, "bad frame"),
		Error::CorruptUpdate => (1003, "update could not be decoded"),
		Error::Unauthorized | Error::PermissionDenied => (1008, "forbidden"),
		Error::Capacity | Error::HubFull => (1001, "at capacity"),
		Error::Shutdown => (1001, "server shutting down"),
		_ => (1001, "internal error"),
	}
}


// vim: ts=4
