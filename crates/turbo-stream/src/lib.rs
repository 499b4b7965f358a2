//! Stream fan-out primitives.
//!
//! This crate provides:
//! - `KeyedQueue` - Bounded or unbounded per-consumer mailboxes keyed by id
//! - `replicate` - Turn one lazy stream into N independent, cancellable replicas
//! - `Replica` - A single consumer's view of a replicated stream
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use turbo_stream::{replicate, QueueCapacity};
//!
//! let mut replicas = replicate(source, 3, QueueCapacity::Unbounded);
//! let first = replicas.remove(0);
//!
//! // Each replica sees every item, independently.
//! let items: Vec<_> = first.collect().await;
//! ```

mod queue;
mod replicate;

pub use queue::*;
pub use replicate::*;
