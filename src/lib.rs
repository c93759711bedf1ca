//! Fast Talk — dual-path conversational core.

pub mod config;
pub mod delivery;
pub mod error;
pub mod fast;
pub mod jobs;
pub mod llm;
pub mod routing;
pub mod server;
pub mod store;
