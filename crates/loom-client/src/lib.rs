//! # loom-client
//!
//! The uplink side of Loom: connecting to remote spaces, remembering *when*
//! we were connected (connection spans) rather than *what* we saw, and
//! fetching that history again only when it is rendered.
//!
//! Also home to [`Shell`], the per-session coordinator an agent drives:
//! submit, fork, switch timelines, drain notifications, render under a budget.

pub mod error;
pub mod host;
pub mod shell;
pub mod spans;
pub mod uplink;

pub use error::{ConnectionError, ShellError};
pub use host::RemoteHost;
pub use loom_kernel::UplinkConfig;
pub use shell::{Shell, ShellContext, ShellPhase};
pub use spans::ConnectionSpanTracker;
pub use uplink::{Attachment, Uplink, bundle_element};
