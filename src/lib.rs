//! nowplaying library
//!
//! Serves a Last.fm user's recent tracks as JSON from a short-lived in-memory
//! snapshot, so bursts of requests cost at most one upstream call per TTL.

pub mod cache;
pub mod cli;
pub mod data;
pub mod server;
