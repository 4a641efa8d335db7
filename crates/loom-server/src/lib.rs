//! # loom-server
//!
//! Hosts Loom spaces for remote uplinks and administers persisted ones.
//!
//! [`SpaceHost`] implements [`loom_client::RemoteHost`] directly over a
//! [`loom_kernel::Loom`], so an uplink in the same process talks to it
//! without a transport. The [`admin`] module backs the `loom-server` binary.

pub mod admin;
pub mod host;

pub use host::{DEFAULT_MAX_PAGE_SIZE, Grant, SpaceHost};
