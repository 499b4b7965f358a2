//! Procedure-aware front end over a query context.

use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use turbo_rpc::{Procedure, RpcClient, RpcError, Transport};

use crate::{Fetcher, Live, LiveArray, LiveItem, Query, QueryContext, QueryError, QueryOptions, StateKey};

/// Binds an `RpcClient` to a `QueryContext`.
pub struct QueryClient<T> {
    rpc: RpcClient<T>,
    context: QueryContext,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            rpc: self.rpc.clone(),
            context: self.context.clone(),
        }
    }
}

impl<T: Transport + 'static> QueryClient<T> {
    /// Create a query client.
    pub fn new(rpc: RpcClient<T>, context: QueryContext) -> Self {
        Self { rpc, context }
    }

    /// The RPC client.
    pub fn rpc(&self) -> &RpcClient<T> {
        &self.rpc
    }

    /// The query context.
    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    /// Create a cached query for procedure `P`.
    ///
    /// The cache key is derived from the path and input unless `options`
    /// overrides it.
    pub fn query<P>(&self, input: P::Input, options: QueryOptions<P::Output>) -> Result<Query<P::Output>, QueryError>
    where
        P: Procedure,
        P::Input: 'static,
    {
        let key = StateKey::named(P::cache_key(&input)?);
        let rpc = self.rpc.clone();
        let input = Arc::new(input);

        let fetcher: Fetcher<P::Output> = Arc::new(move || -> BoxFuture<'static, Result<P::Output, RpcError>> {
            let rpc = rpc.clone();
            let input = Arc::clone(&input);
            async move { rpc.call::<P>(&input).await }.boxed()
        });

        Ok(Query::new(&self.context, key, fetcher, options))
    }

    /// Open a stream of `P` and track its latest item.
    pub async fn live<P: Procedure>(&self, input: &P::Input, name: Option<&str>) -> Result<Live<P::Output>, RpcError> {
        let stream = self.rpc.stream::<P>(input).await?;
        let live = Live::new(self.context.live_store(), name);
        live.start(stream);
        Ok(live)
    }

    /// Open a stream of `P` and accumulate its items into an array.
    pub async fn live_array<P, I>(&self, input: &P::Input, name: Option<&str>) -> Result<LiveArray<I>, RpcError>
    where
        P: Procedure<Output = LiveItem<I>>,
        I: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let stream = self.rpc.stream::<P>(input).await?;
        let live = LiveArray::new(self.context.live_store(), name);
        live.start(stream);
        Ok(live)
    }
}

impl<T> fmt::Debug for QueryClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("base_url", &self.rpc.base_url())
            .field("context", &self.context)
            .finish()
    }
}
