//! Shared process state, in the spirit of the reference server's
//! `AppState`/`App` pattern: one `Arc<AppState>` cloned into every handler.

use std::sync::Arc;

use collab_bus::Bus;
use collab_types::Settings;

use crate::auth::AuthGate;
use crate::registry::Registry;

pub struct AppState {
	pub settings: Arc<Settings>,
	pub registry: Arc<Registry>,
	pub auth_gate: Arc<dyn AuthGate>,
	pub bus: Arc<dyn Bus>,
}

pub type App = Arc<AppState>;

// vim: ts=4
