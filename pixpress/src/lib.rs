//! pixpress library crate.
//!
//! A local image compression backend: jobs are admitted into a bounded
//! priority queue, dispatched to a fixed-size pool of thread or process
//! units, retried with exponential backoff, and reported through an event
//! bus to HTTP/WebSocket clients.

pub mod api;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;

pub use error::{Error, JobError, Result};
