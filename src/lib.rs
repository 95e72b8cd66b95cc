// ABOUTME: Root library module for the relaygate gateway process
// ABOUTME: Configuration, process wiring, the ingest pipeline and the admin HTTP surface

pub mod admin;
pub mod config;
pub mod gateway;
pub mod paths;
pub mod server;

// Re-export the core crate for convenience
pub use relaygate_core as core;
