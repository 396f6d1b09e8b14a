//! The top-level client facade: a single type that owns a
//! secure channel and an activated session, for callers who don't need to
//! assemble the dispatcher and session layers themselves.

pub mod client;

pub use client::OpcUaClient;
