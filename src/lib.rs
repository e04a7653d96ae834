//! Pressgate - Request Throttling and Batch Task Processing
//!
//! This crate guards a content automation API with layered sliding-window
//! rate limits and automatic blocking of abusive clients, and runs
//! long-running content tasks (keyword analysis, title generation, content
//! generation and composite workflows) through a bounded-concurrency queue.

pub mod batch;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
