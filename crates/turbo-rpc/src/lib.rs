//! Call model and transport interface for TurboQuery.
//!
//! This crate provides:
//! - `Call` - Method, URL, headers, body and cancellation signal
//! - `CallKey` - Canonical equivalence key used for coalescing
//! - `Response` - One-shot payload or a lazy stream of payloads
//! - `Transport` - The upstream link every layer calls through
//! - `Procedure` / `RpcClient` - Statically typed procedure table
//!
//! # Example
//!
//! ```ignore
//! use turbo_rpc::{Method, Procedure, RpcClient};
//!
//! struct ListPlanets;
//!
//! impl Procedure for ListPlanets {
//!     type Input = ();
//!     type Output = Vec<Planet>;
//!     const PATH: &'static str = "planet.list";
//!     const METHOD: Method = Method::Get;
//! }
//!
//! let client = RpcClient::new(link, "http://localhost:3000/rpc");
//! let planets = client.call::<ListPlanets>(&()).await?;
//! ```

mod call;
mod error;
mod procedure;
mod response;
mod signal;
mod transport;

pub use call::*;
pub use error::*;
pub use procedure::*;
pub use response::*;
pub use signal::*;
pub use transport::*;

/// Re-exported so callers don't need a direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
