//! Bus wire envelope.
//!
//! The reference implementation this server's protocol is modeled on
//! serializes the envelope as a JSON object with the update payload encoded
//! as a JSON array of byte values. That is correct but wasteful: for a 64
//! KiB update it inflates the wire size by roughly 3-4x and forces a
//! allocate-and-parse-every-element pass on both ends. This adapts the
//! envelope into a compact, length-prefixed binary layout instead; only the
//! structure (not the meaning) of the fields changes.

use collab_types::{ClResult, DocumentId, Error, InstanceId};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
	Update,
	Awareness,
}

impl EnvelopeKind {
	fn as_u8(self) -> u8 {
		match self {
			EnvelopeKind::Update => 0,
			EnvelopeKind::Awareness => 1,
		}
	}

	fn from_u8(b: u8) -> ClResult<Self> {
		match b {
			0 => Ok(EnvelopeKind::Update),
			1 => Ok(EnvelopeKind::Awareness),
			other => Err(Error::BusDecode(format!("unknown envelope kind tag {other}"))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
	pub index: u32,
	pub total: u32,
}

#[derive(Debug, Clone)]
pub struct BusEnvelope {
	pub document_id: DocumentId,
	pub kind: EnvelopeKind,
	pub payload: Box<[u8]>,
	pub origin: Option<Box<str>>,
	pub instance_id: InstanceId,
	pub message_id: Uuid,
	pub timestamp_ms: u64,
	pub chunk: Option<ChunkInfo>,
}

impl BusEnvelope {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(64 + self.payload.len());
		out.push(self.kind.as_u8());
		write_str(&mut out, self.document_id.as_str());
		match &self.origin {
			Some(o) => {
				out.push(1);
				write_str(&mut out, o);
			}
			None => out.push(0),
		}
		write_str(&mut out, self.instance_id.as_str());
		out.extend_from_slice(self.message_id.as_bytes());
		out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
		match self.chunk {
			Some(c) => {
				out.push(1);
				out.extend_from_slice(&c.index.to_be_bytes());
				out.extend_from_slice(&c.total.to_be_bytes());
			}
			None => out.push(0),
		}
		write_bytes(&mut out, &self.payload);
		out
	}

	pub fn decode(bytes: &[u8]) -> ClResult<Self> {
		let mut cur = Cursor { bytes, pos: 0 };
		let kind = EnvelopeKind::from_u8(cur.take_u8()?)?;
		let document_id = DocumentId::parse(&cur.take_str()?);
		let origin = if cur.take_u8()? == 1 { Some(cur.take_str()?.into_boxed_str()) } else { None };
		let instance_id = InstanceId::new(cur.take_str()?);
		let message_id_bytes = cur.take_slice(16)?;
		let message_id = Uuid::from_slice(message_id_bytes).map_err(|e| Error::BusDecode(e.to_string()))?;
		let timestamp_ms = u64::from_be_bytes(cur.take_slice(8)?.try_into().map_err(|_| Error::BusDecode("short timestamp".into()))?);
		let chunk = if cur.take_u8()? == 1 {
			let index = u32::from_be_bytes(cur.take_slice(4)?.try_into().map_err(|_| Error::BusDecode("short chunk index".into()))?);
			let total = u32::from_be_bytes(cur.take_slice(4)?.try_into().map_err(|_| Error::BusDecode("short chunk total".into()))?);
			Some(ChunkInfo { index, total })
		} else {
			None
		};
		let payload = cur.take_bytes()?.into();

		Ok(Self { document_id, kind, payload, origin, instance_id, message_id, timestamp_ms, chunk })
	}
}

fn write_str(out: &mut Vec<u8>, s: &str) {
	write_bytes(out, s.as_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
	#[allow(clippy::cast_possible_truncation)]
	out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
	out.extend_from_slice(bytes);
}

struct Cursor<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn take_u8(&mut self) -> ClResult<u8> {
		let b = *self.bytes.get(self.pos).ok_or_else(|| Error::BusDecode("truncated envelope".into()))?;
		self.pos += 1;
		Ok(b)
	}

	fn take_slice(&mut self, len: usize) -> ClResult<&'a [u8]> {
		let end = self.pos.checked_add(len).ok_or_else(|| Error::BusDecode("envelope length overflow".into()))?;
		let slice = self.bytes.get(self.pos..end).ok_or_else(|| Error::BusDecode("truncated envelope".into()))?;
		self.pos = end;
		Ok(slice)
	}

	fn take_bytes(&mut self) -> ClResult<&'a [u8]> {
		let len_bytes = self.take_slice(4)?;
		let len = u32::from_be_bytes(len_bytes.try_into().map_err(|_| Error::BusDecode("short length".into()))?) as usize;
		self.take_slice(len)
	}

	fn take_str(&mut self) -> ClResult<String> {
		let bytes = self.take_bytes()?;
		String::from_utf8(bytes.to_vec()).map_err(|e| Error::BusDecode(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_a_full_envelope() {
		let env = BusEnvelope {
			document_id: DocumentId::parse("doc1"),
			kind: EnvelopeKind::Update,
			payload: vec![1, 2, 3, 4].into_boxed_slice(),
			origin: Some("client-7".into()),
			instance_id: InstanceId::new("instance-a"),
			message_id: Uuid::from_u128(42),
			timestamp_ms: 1_700_000_000_000,
			chunk: None,
		};
		let bytes = env.encode();
		let decoded = BusEnvelope::decode(&bytes).expect("decodes");
		assert_eq!(decoded.document_id, env.document_id);
		assert_eq!(decoded.payload, env.payload);
		assert_eq!(decoded.origin, env.origin);
		assert_eq!(decoded.instance_id, env.instance_id);
		assert_eq!(decoded.message_id, env.message_id);
		assert_eq!(decoded.timestamp_ms, env.timestamp_ms);
	}

	#[test]
	fn round_trips_chunk_metadata() {
		let env = BusEnvelope {
			document_id: DocumentId::parse("doc1"),
			kind: EnvelopeKind::Update,
			payload: vec![9; 10].into_boxed_slice(),
			origin: None,
			instance_id: InstanceId::new("instance-a"),
			message_id: Uuid::from_u128(1),
			timestamp_ms: 0,
			chunk: Some(ChunkInfo { index: 2, total: 5 }),
		};
		let decoded = BusEnvelope::decode(&env.encode()).expect("decodes");
		assert_eq!(decoded.chunk, Some(ChunkInfo { index: 2, total: 5 }));
	}

	#[test]
	fn truncated_bytes_are_rejected_not_panicking() {
		assert!(BusEnvelope::decode(&[0, 0, 0, 0, 5]).is_err());
	}
}

// vim: ts=4
