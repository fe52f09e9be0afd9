//! Tallysync Client - HTTP client for the Tally XML export interface
//!
//! This crate provides:
//!
//! - [`envelope`] - request envelopes for collection and report exports
//! - [`tally`] - the HTTP client, response decoding and error detection
//! - [`retry`] - bounded exponential backoff used by the client
//!
//! # Overview
//!
//! [`TallyClient`] implements [`tallysync_core::source::TallySource`], so the
//! sync orchestrator can drive it without knowing about HTTP.

pub mod envelope;
pub mod retry;
pub mod tally;

// Re-export main client types
pub use envelope::build_envelope;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use tally::TallyClient;
