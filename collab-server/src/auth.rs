//! Auth Gate (C8): validates an inbound credential before upgrade and
//! decides whether a principal may open a given document. Mirrors the
//! `jsonwebtoken`-based validation the reference auth middleware uses, but
//! does not mint tokens.

use async_trait::async_trait;
use collab_types::prelude::*;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[async_trait]
pub trait AuthGate: Send + Sync {
	async fn validate_token(&self, token: &str) -> ClResult<Principal>;
	fn may_open(&self, principal: &Principal, document_id: &DocumentId) -> bool;
}

#[derive(Debug, Deserialize)]
struct Claims {
	sub: Box<str>,
	#[serde(default)]
	username: Option<Box<str>>,
	#[serde(default)]
	permissions: Vec<Box<str>>,
	exp: i64,
}

pub struct JwtAuthGate {
	decoding_key: DecodingKey,
	validation: Validation,
	default_open_policy: bool,
}

impl JwtAuthGate {
	pub fn new(secret: &str, algorithm: Algorithm, default_open_policy: bool) -> Self {
		let decoding_key = match algorithm {
			Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => DecodingKey::from_secret(secret.as_bytes()),
			_ => DecodingKey::from_secret(secret.as_bytes()),
		};
		Self { decoding_key, validation: Validation::new(algorithm), default_open_policy }
	}
}

#[async_trait]
impl AuthGate for JwtAuthGate {
	async fn validate_token(&self, token: &str) -> ClResult<Principal> {
		let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
		let claims = data.claims;
		Ok(Principal {
			user_id: claims.sub.clone(),
			username: claims.username.unwrap_or(claims.sub),
			permissions: claims.permissions.into_boxed_slice(),
			exp: claims.exp,
		})
	}

	fn may_open(&self, principal: &Principal, document_id: &DocumentId) -> bool {
		principal.may_open(document_id.as_str(), self.default_open_policy)
	}
}

/// Extract a bearer credential from either the `Authorization` header or
/// the WebSocket `auth.<base64url(token)>` subprotocol, per §6.1. Returns
/// `None` if neither is present or the subprotocol token exceeds the
/// configured length cap.
pub fn extract_token(authorization_header: Option<&str>, subprotocols: &[String]) -> Option<String> {
	const MAX_SUBPROTOCOL_TOKEN_LEN: usize = 1000;

	if let Some(header) = authorization_header {
		if let Some(token) = header.strip_prefix("Bearer ") {
			return Some(token.to_string());
		}
	}

	for proto in subprotocols {
		if let Some(encoded) = proto.strip_prefix("auth.") {
			if encoded.len() > MAX_SUBPROTOCOL_TOKEN_LEN {
				continue;
			}
			use base64::Engine;
			if let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(encoded) {
				if let Ok(token) = String::from_utf8(bytes) {
					return Some(token);
				}
			}
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use jsonwebtoken::{encode, EncodingKey, Header};

	fn token_for(sub: &str, permissions: &[&str], exp: i64) -> String {
		#[derive(serde::Serialize)]
		struct Claims<'a> {
			sub: &'a str,
			permissions: Vec<&'a str>,
			exp: i64,
		}
		encode(&Header::new(Algorithm::HS256), &Claims { sub, permissions: permissions.to_vec(), exp }, &EncodingKey::from_secret(b"test-secret"))
			.expect("encodes")
	}

	#[tokio::test]
	async fn valid_token_decodes_into_principal() {
		let gate = JwtAuthGate::new("test-secret", Algorithm::HS256, true);
		let token = token_for("alice", &["doc:doc1"], 9_999_999_999);
		let principal = gate.validate_token(&token).await.expect("decodes");
		assert_eq!(principal.user_id.as_ref(), "alice");
	}

	#[tokio::test]
	async fn expired_token_is_rejected() {
		let gate = JwtAuthGate::new("test-secret", Algorithm::HS256, true);
		let token = token_for("alice", &[], 1);
		assert!(gate.validate_token(&token).await.is_err());
	}

	#[tokio::test]
	async fn wrong_secret_is_rejected() {
		let gate = JwtAuthGate::new("other-secret", Algorithm::HS256, true);
		let token = token_for("alice", &[], 9_999_999_999);
		assert!(gate.validate_token(&token).await.is_err());
	}

	#[test]
	fn extract_token_prefers_bearer_header() {
		let token = extract_token(Some("Bearer abc123"), &["auth.ZGVm".to_string()]);
		assert_eq!(token.as_deref(), Some("abc123"));
	}

	#[test]
	fn extract_token_falls_back_to_subprotocol() {
		use base64::Engine;
		let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("xyz789");
		let proto = format!("auth.{encoded}");
		let token = extract_token(None, &[proto]);
		assert_eq!(token.as_deref(), Some("xyz789"));
	}

	#[test]
	fn extract_token_absent_returns_none() {
		assert_eq!(extract_token(None, &[]), None);
	}
}

// vim: ts=4
