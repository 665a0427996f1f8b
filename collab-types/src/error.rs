//! Error handling subsystem. Implements a custom Error type.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::prelude::*;

pub type ClResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize)]
struct ErrorResponse {
	code: String,
	message: String,
}

impl ErrorResponse {
	fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { code: code.into(), message: message.into() }
	}
}

#[derive(Debug)]
pub enum Error {
	// Auth Gate (C8)
	Unauthorized,
	PermissionDenied,

	// Document Registry (C6) / Document Hub (C5)
	Capacity,
	HubFull,
	ActiveClients,
	NotFound,

	// Sync Protocol (C3), surfaced only as close reasons by callers, but
	// also usable as an internal error value
	Protocol(String),
	CorruptUpdate,

	// Bus (C4)
	BusPublish(String),
	BusDecode(String),

	// System and configuration
	ConfigError(String),
	Internal(String),

	// Lifecycle: graceful drain (§5, §7), surfaced only as a close reason
	Shutdown,

	// externals
	Io(std::io::Error),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!("io error: {}", err);
		Self::Io(err)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
	fn into_response(self) -> axum::response::Response {
		let (status, code, message) = match self {
			Error::Unauthorized => (
				StatusCode::UNAUTHORIZED,
				"E-AUTH-UNAUTH",
				"Authentication required or invalid token".to_string(),
			),
			Error::PermissionDenied => (
				StatusCode::FORBIDDEN,
				"E-AUTH-NOPERM",
				"You do not have permission to open this document".to_string(),
			),
			Error::Capacity => (
				StatusCode::SERVICE_UNAVAILABLE,
				"E-REG-CAPACITY",
				"Document registry has reached its configured hub capacity".to_string(),
			),
			Error::HubFull => (
				StatusCode::SERVICE_UNAVAILABLE,
				"E-HUB-FULL",
				"Document has reached its configured client capacity".to_string(),
			),
			Error::ActiveClients => (
				StatusCode::CONFLICT,
				"E-REG-ACTIVE",
				"Document still has active clients".to_string(),
			),
			Error::NotFound => (
				StatusCode::NOT_FOUND,
				"E-REG-NOTFOUND",
				"Document not found".to_string(),
			),
			Error::Protocol(msg) => {
				warn!("protocol error: {}", msg);
				(StatusCode::BAD_REQUEST, "E-SYNC-PROTOCOL", "Malformed frame".to_string())
			}
			Error::CorruptUpdate => (
				StatusCode::BAD_REQUEST,
				"E-SYNC-CORRUPT",
				"Update could not be decoded".to_string(),
			),
			Error::BusPublish(msg) => {
				warn!("bus publish error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-BUS-PUBLISH", "Internal server error".to_string())
			}
			Error::BusDecode(msg) => {
				warn!("bus decode error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-BUS-DECODE", "Internal server error".to_string())
			}
			Error::ConfigError(msg) => {
				warn!("config error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-CONF-CFGERR", "Internal server error".to_string())
			}
			Error::Internal(msg) => {
				warn!("internal error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-CORE-INTERNAL", "Internal server error".to_string())
			}
			Error::Shutdown => (
				StatusCode::SERVICE_UNAVAILABLE,
				"E-SYS-SHUTDOWN",
				"Server is shutting down".to_string(),
			),
			Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "E-SYS-IO", "Internal server error".to_string()),
		};

		let error_response = ErrorResponse::new(code, message);
		(status, Json(error_response)).into_response()
	}
}

impl From<jsonwebtoken::errors::Error> for Error {
	fn from(err: jsonwebtoken::errors::Error) -> Self {
		warn!("jwt error: {}", err);
		Error::Unauthorized
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		warn!("json error: {}", err);
		Error::BusDecode(err.to_string())
	}
}

// vim: ts=4
