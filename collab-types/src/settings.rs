//! Process configuration, loaded from environment variables with typed defaults.
//!
//! Validated once at startup and then handed around as an immutable
//! `Arc<Settings>`; nothing below main ever re-reads the environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ClResult, Error};
use crate::ids::InstanceId;

#[derive(Debug, Clone)]
pub struct Settings {
	pub ping_interval: Duration,
	pub outbound_queue_cap: usize,
	pub idle_grace: Duration,
	pub max_hubs: Option<usize>,
	pub max_clients_per_hub: usize,
	pub bus_prefix: Box<str>,
	pub bus_chunk_threshold: usize,
	pub bus_chunk_reassembly_timeout: Duration,
	pub instance_id: InstanceId,
	pub default_open_policy: bool,
	pub redis_url: Box<str>,
	pub listen_addr: SocketAddr,
	pub admin_listen_addr: Option<SocketAddr>,
	pub jwt_secret: Box<str>,
	pub jwt_algorithm: jsonwebtoken::Algorithm,
	pub drain_deadline: Duration,
}

impl Settings {
	pub fn from_env() -> ClResult<Self> {
		Ok(Self {
			ping_interval: env_duration_secs("COLLAB_PING_INTERVAL_SECS", 30)?,
			outbound_queue_cap: env_usize("COLLAB_OUTBOUND_QUEUE_CAP", 256)?,
			idle_grace: env_duration_secs("COLLAB_IDLE_GRACE_SECS", 30 * 60)?,
			max_hubs: env_opt_usize("COLLAB_MAX_HUBS")?,
			max_clients_per_hub: env_usize("COLLAB_MAX_CLIENTS_PER_HUB", 50)?,
			bus_prefix: env_str("COLLAB_BUS_PREFIX", "collab:"),
			bus_chunk_threshold: env_usize("COLLAB_BUS_CHUNK_THRESHOLD", 64 * 1024)?,
			bus_chunk_reassembly_timeout: env_duration_secs("COLLAB_BUS_CHUNK_TIMEOUT_SECS", 10)?,
			instance_id: std::env::var("COLLAB_INSTANCE_ID")
				.map(InstanceId::new)
				.unwrap_or_else(|_| InstanceId::random()),
			default_open_policy: env_bool("COLLAB_DEFAULT_OPEN_POLICY", true)?,
			redis_url: env_str("COLLAB_REDIS_URL", "redis://127.0.0.1:6379"),
			listen_addr: env_socket_addr("COLLAB_LISTEN_ADDR", "127.0.0.1:8080")?,
			admin_listen_addr: match std::env::var("COLLAB_ADMIN_LISTEN_ADDR") {
				Ok(v) => Some(
					v.parse()
						.map_err(|_| Error::ConfigError(format!("invalid COLLAB_ADMIN_LISTEN_ADDR: {v}")))?,
				),
				Err(_) => None,
			},
			jwt_secret: env_str("COLLAB_JWT_SECRET", "dev-only-insecure-secret"),
			jwt_algorithm: match env_str("COLLAB_JWT_ALGORITHM", "HS256").as_ref() {
				"HS256" => jsonwebtoken::Algorithm::HS256,
				"ES256" => jsonwebtoken::Algorithm::ES256,
				other => return Err(Error::ConfigError(format!("unsupported COLLAB_JWT_ALGORITHM: {other}"))),
			},
			drain_deadline: env_duration_secs("COLLAB_DRAIN_DEADLINE_SECS", 5)?,
		})
	}
}

fn env_str(key: &str, default: &str) -> Box<str> {
	std::env::var(key).map(Box::from).unwrap_or_else(|_| default.into())
}

fn env_usize(key: &str, default: usize) -> ClResult<usize> {
	match std::env::var(key) {
		Ok(v) => v.parse().map_err(|_| Error::ConfigError(format!("invalid {key}: {v}"))),
		Err(_) => Ok(default),
	}
}

fn env_opt_usize(key: &str) -> ClResult<Option<usize>> {
	match std::env::var(key) {
		Ok(v) => Ok(Some(v.parse().map_err(|_| Error::ConfigError(format!("invalid {key}: {v}")))?)),
		Err(_) => Ok(None),
	}
}

fn env_bool(key: &str, default: bool) -> ClResult<bool> {
	match std::env::var(key) {
		Ok(v) => v.parse().map_err(|_| Error::ConfigError(format!("invalid {key}: {v}"))),
		Err(_) => Ok(default),
	}
}

fn env_duration_secs(key: &str, default_secs: u64) -> ClResult<Duration> {
	Ok(Duration::from_secs(env_usize(key, default_secs as usize)? as u64))
}

fn env_socket_addr(key: &str, default: &str) -> ClResult<SocketAddr> {
	let raw = env_str(key, default);
	raw.parse().map_err(|_| Error::ConfigError(format!("invalid {key}: {raw}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_parse_without_any_env_vars() {
		let s = Settings {
			ping_interval: Duration::from_secs(30),
			outbound_queue_cap: 256,
			idle_grace: Duration::from_secs(1800),
			max_hubs: None,
			max_clients_per_hub: 50,
			bus_prefix: "collab:".into(),
			bus_chunk_threshold: 65536,
			bus_chunk_reassembly_timeout: Duration::from_secs(10),
			instance_id: InstanceId::random(),
			default_open_policy: true,
			redis_url: "redis://127.0.0.1:6379".into(),
			listen_addr: env_socket_addr("COLLAB_LISTEN_ADDR_TEST_UNSET", "127.0.0.1:8080").unwrap(),
			admin_listen_addr: None,
			jwt_secret: "dev-only-insecure-secret".into(),
			jwt_algorithm: jsonwebtoken::Algorithm::HS256,
			drain_deadline: Duration::from_secs(5),
		};
		assert_eq!(s.max_clients_per_hub, 50);
	}
}

// vim: ts=4
