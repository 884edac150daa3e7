//! Queue backend implementations.
//!
//! This module contains concrete implementations of the `QueueBackend`
//! trait: an in-memory backend for tests and demos, and the SQS binding.

pub mod aws;
pub mod memory;

pub use aws::SqsBackend;
pub use memory::{DeleteCall, InMemoryBackend, InMemoryConfig, VisibilityChange};
