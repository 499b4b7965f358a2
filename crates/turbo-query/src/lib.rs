//! Time-aware reactive cache for RPC results.
//!
//! This crate provides:
//! - `CacheManager` - Query and mutation caches with staleness and eviction windows
//! - `ActiveRegistry` - Reference-counted pins that keep mounted keys alive
//! - `Query` - A cached value with loading, error and refetch state
//! - `Live` / `LiveArray` - State fed by a stream until stopped
//! - `QueryContext` - Explicitly scoped caches and sweeper
//! - `QueryClient` - Typed procedures bound to a context
//!
//! # Example
//!
//! ```ignore
//! use turbo_query::{QueryClient, QueryConfig, QueryContext, QueryOptions};
//!
//! let context = QueryContext::start(QueryConfig::default());
//! let client = QueryClient::new(rpc, context);
//!
//! let planets = client.query::<ListPlanets>((), QueryOptions::new())?;
//! let _mounted = planets.mount();
//! planets.fetch_if_needed().await?;
//! ```

mod cache;
mod client;
mod config;
mod context;
mod error;
mod live;
mod query;
mod registry;
mod retry;

pub use cache::*;
pub use client::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use live::*;
pub use query::*;
pub use registry::*;
pub use retry::*;
