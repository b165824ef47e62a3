//! sandbridge: glue between an isolated agent sandbox and the outside world.
//!
//! Three processes share this crate:
//!
//! - [`bridge`] runs inside the sandbox and turns line-delimited JSON on stdin
//!   into turns of a persistent Claude session, answered on stdout.
//! - [`proxy`] runs outside the sandbox and swaps the sandbox's placeholder
//!   credential for the real API key while streaming responses back.
//! - [`sync`] runs outside the sandbox and uploads telemetry files the sandbox
//!   leaves on a shared volume.

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod secrets;
pub mod sync;
