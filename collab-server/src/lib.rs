//! Library half of the collaboration server: everything except the process
//! entrypoint, mirroring the reference split between a `cloudillo` library
//! crate and its thin `basic-server` binary.

pub mod admin;
pub mod app;
pub mod auth;
pub mod frame;
pub mod hub;
pub mod metrics;
pub mod registry;
pub mod session;

// vim: ts=4
