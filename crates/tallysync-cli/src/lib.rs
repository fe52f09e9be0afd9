//! Tallysync CLI - Command-line entrypoint for Tally synchronization
//!
//! This crate provides the CLI application that ties together the Tally
//! client, the PostgreSQL store and the sync orchestrator.

pub mod config;

pub use config::{Command, Config};
