//! Wire framing for the client-facing Sync Protocol (C3), layered on the
//! one-byte-tagged binary frames of the Framed Transport (C2).

use collab_crdt::{AwarenessBlob, StateVector, UpdateBlob};
use collab_types::{ClResult, Error};

const TAG_SYNC: u8 = 0;
const TAG_AWARENESS: u8 = 1;

const SYNC_STEP1: u8 = 0;
const SYNC_STEP2: u8 = 1;
const SYNC_UPDATE: u8 = 2;

#[derive(Debug, Clone)]
pub enum SyncMessage {
	Step1(StateVector),
	Step2(UpdateBlob),
	Update(UpdateBlob),
}

#[derive(Debug, Clone)]
pub enum Frame {
	Sync(SyncMessage),
	Awareness(AwarenessBlob),
}

impl Frame {
	pub fn encode(&self) -> Vec<u8> {
		match self {
			Frame::Sync(SyncMessage::Step1(sv)) => tagged(TAG_SYNC, SYNC_STEP1, sv.as_bytes()),
			Frame::Sync(SyncMessage::Step2(blob)) => tagged(TAG_SYNC, SYNC_STEP2, blob.as_bytes()),
			Frame::Sync(SyncMessage::Update(blob)) => tagged(TAG_SYNC, SYNC_UPDATE, blob.as_bytes()),
			Frame::Awareness(blob) => {
				let mut out = Vec::with_capacity(1 + blob.as_bytes().len());
				out.push(TAG_AWARENESS);
				out.extend_from_slice(blob.as_bytes());
				out
			}
		}
	}

	pub fn decode(bytes: &[u8]) -> ClResult<Self> {
		let (&tag, rest) = bytes.split_first().ok_or_else(|| Error::Protocol("empty frame".into()))?;
		match tag {
			TAG_SYNC => {
				let (&subtag, payload) =
					rest.split_first().ok_or_else(|| Error::Protocol("sync frame missing subtag".into()))?;
				let msg = match subtag {
					SYNC_STEP1 => SyncMessage::Step1(StateVector::from_bytes(payload.to_vec())),
					SYNC_STEP2 => SyncMessage::Step2(UpdateBlob::from_bytes(payload.to_vec())),
					SYNC_UPDATE => SyncMessage::Update(UpdateBlob::from_bytes(payload.to_vec())),
					other => return Err(Error::Protocol(format!("unknown sync subtag {other}"))),
				};
				Ok(Frame::Sync(msg))
			}
			TAG_AWARENESS => Ok(Frame::Awareness(AwarenessBlob::from_bytes(rest.to_vec()))),
			other => Err(Error::Protocol(format!("unknown frame tag {other}"))),
		}
	}
}

fn tagged(tag: u8, subtag: u8, payload: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(2 + payload.len());
	out.push(tag);
	out.push(subtag);
	out.extend_from_slice(payload);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn step1_round_trips() {
		let sv = StateVector::from_bytes(vec![1, 2, 3]);
		let frame = Frame::Sync(SyncMessage::Step1(sv.clone()));
		let decoded = Frame::decode(&frame.encode()).expect("decodes");
		match decoded {
			Frame::Sync(SyncMessage::Step1(decoded_sv)) => assert_eq!(decoded_sv.as_bytes(), sv.as_bytes()),
			_ => panic!("expected Step1"),
		}
	}

	#[test]
	fn awareness_round_trips() {
		let blob = AwarenessBlob::from_bytes(vec![9, 9]);
		let frame = Frame::Awareness(blob.clone());
		let decoded = Frame::decode(&frame.encode()).expect("decodes");
		match decoded {
			Frame::Awareness(decoded_blob) => assert_eq!(decoded_blob.as_bytes(), blob.as_bytes()),
			_ => panic!("expected Awareness"),
		}
	}

	#[test]
	fn empty_frame_is_protocol_error() {
		assert!(Frame::decode(&[]).is_err());
	}

	#[test]
	fn unknown_tag_is_protocol_error() {
		assert!(Frame::decode(&[9, 0, 0]).is_err());
	}
}

// vim: ts=4
