//! Request coalescing for RPC transports.
//!
//! This crate provides:
//! - `DedupeLink` - A transport that merges equivalent calls made in one window
//! - `combine` - AND-combination of cancellation signals
//! - `FlushScheduler` - Injectable deferral window (`TokioScheduler`, `ManualScheduler`)
//! - `Coalesced` - The same batching applied to a plain async function
//!
//! # Example
//!
//! ```ignore
//! use turbo_dedupe::{DedupeGroup, DedupeLink};
//!
//! let link = DedupeLink::builder(transport)
//!     .with_group(DedupeGroup::all("reads"))
//!     .build();
//!
//! // Three equivalent GETs in the same turn reach the transport once.
//! let (a, b, c) = tokio::join!(
//!     link.submit(Call::get("/rpc/planet/list"), CallContext::new()),
//!     link.submit(Call::get("/rpc/planet/list"), CallContext::new()),
//!     link.submit(Call::get("/rpc/planet/list"), CallContext::new()),
//! );
//! ```

mod coalesce;
mod combine;
mod config;
mod link;
mod scheduler;

pub use coalesce::*;
pub use combine::*;
pub use config::*;
pub use link::*;
pub use scheduler::*;
