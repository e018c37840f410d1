//! IPC types broadcast to host frontends.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` with camelCase
//! field names so hosts can forward them as JSON unchanged.

pub mod events;
