//! CRDT Replica Adapter
//!
//! Wraps `yrs` (the Rust port of Yjs) behind the opaque `UpdateBlob` /
//! `StateVector` types so the rest of the collaboration server never touches
//! Yjs-internal encodings directly.
//!
//! Awareness (presence) is not routed through `yrs`'s own awareness wire
//! format; it is kept as a small first-class `ClientId -> (clock, state)`
//! table here, merged by clock comparison and encoded as JSON. See
//! DESIGN.md for why.

pub mod awareness;
pub mod blob;
pub mod replica;

pub use awareness::{AwarenessEntry, AwarenessMerge, AwarenessTable};
pub use blob::{AwarenessBlob, StateVector, UpdateBlob};
pub use replica::Replica;

// vim: ts=4
