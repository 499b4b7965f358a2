//! The upstream transport interface.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{Call, CallContext, Response, RpcError};

/// An upstream link that performs calls.
///
/// The wire encoding lives behind this trait; the layers in this workspace
/// only see calls going in and payloads or streams coming out.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a call.
    async fn call(&self, call: Call, ctx: CallContext) -> Result<Response, RpcError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn call(&self, call: Call, ctx: CallContext) -> Result<Response, RpcError> {
        (**self).call(call, ctx).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn call(&self, call: Call, ctx: CallContext) -> Result<Response, RpcError> {
        (**self).call(call, ctx).await
    }
}

/// Transport backed by a closure.
///
/// Handy for in-process links, simulations and tests.
pub struct FnTransport<F> {
    handler: F,
}

impl<F, Fut> FnTransport<F>
where
    F: Fn(Call, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, RpcError>> + Send,
{
    /// Create a transport from a closure.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Call, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, RpcError>> + Send,
{
    async fn call(&self, call: Call, ctx: CallContext) -> Result<Response, RpcError> {
        (self.handler)(call, ctx).await
    }
}
