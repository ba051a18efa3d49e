//! Network utilities for HTTP operations and retries.
//!
//! This module provides:
//! - Retry logic with exponential backoff and jitter
//! - An authenticated HTTP client that classifies responses by status code

mod client;
mod retry;

pub use client::{HttpClient, ServerRole};
pub use retry::{retry_async, retry_call, retry_call_with_stats, RetryConfig, RetryStats};
