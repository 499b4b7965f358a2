//! Statically typed procedure table and client.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{decode_payload, Call, CallContext, Headers, Method, Response, RpcError, Transport};

/// A remote procedure with typed input and output.
///
/// Each procedure is declared once as a type; calls are dispatched through
/// `RpcClient` with compile-time checked inputs and outputs.
pub trait Procedure: Send + Sync + 'static {
    /// Input type, serialized as JSON.
    type Input: Serialize + Send + Sync;
    /// Output type (or stream item type), decoded from JSON.
    type Output: DeserializeOwned + Send + Sync + 'static;

    /// Dot-separated procedure path (e.g., `planet.list`).
    const PATH: &'static str;

    /// HTTP method used to reach the procedure.
    const METHOD: Method = Method::Post;

    /// Build the procedure URL under a base URL.
    fn url(base: &str) -> String {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            Self::PATH.replace('.', "/")
        )
    }

    /// Cache key derived from the path and the input.
    ///
    /// A `null` input keys by path alone.
    fn cache_key(input: &Self::Input) -> Result<String, RpcError> {
        let value = serde_json::to_value(input)?;
        if value.is_null() {
            Ok(Self::PATH.to_string())
        } else {
            Ok(format!("{}:{}", Self::PATH, value))
        }
    }
}

/// Typed stream of procedure outputs.
pub type TypedStream<T> = BoxStream<'static, Result<T, RpcError>>;

/// Client dispatching typed procedures over a transport.
pub struct RpcClient<T> {
    transport: Arc<T>,
    base_url: String,
    default_headers: Headers,
}

impl<T> Clone for RpcClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            base_url: self.base_url.clone(),
            default_headers: self.default_headers.clone(),
        }
    }
}

impl<T> RpcClient<T> {
    /// Get the underlying transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl<T: Transport> RpcClient<T> {
    /// Create a client over a transport.
    pub fn new(transport: T, base_url: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(transport), base_url)
    }

    /// Create a client over a shared transport.
    pub fn from_arc(transport: Arc<T>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            default_headers: Headers::new(),
        }
    }

    /// Add a header sent with every call.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Build the call for a procedure invocation.
    ///
    /// GET inputs travel in the `data` query parameter; every other method
    /// sends the input as a JSON body.
    pub fn build_call<P: Procedure>(&self, input: &P::Input) -> Result<Call, RpcError> {
        let input = serde_json::to_value(input)?;
        let mut call = Call::new(P::METHOD, P::url(&self.base_url));

        for (name, value) in &self.default_headers {
            call = call.header(name.clone(), value.clone());
        }

        call = match (P::METHOD, input) {
            (Method::Get, Value::Null) => call,
            (Method::Get, input) => call.query_param("data", &input.to_string()),
            (_, input) => call.json(input),
        };

        Ok(call)
    }

    /// Send a raw call.
    pub async fn send(&self, call: Call) -> Result<Response, RpcError> {
        self.transport.call(call, CallContext::default()).await
    }

    /// Invoke a one-shot procedure.
    pub async fn call<P: Procedure>(&self, input: &P::Input) -> Result<P::Output, RpcError> {
        let call = self.build_call::<P>(input)?;
        self.send(call).await?.decode()
    }

    /// Invoke a one-shot procedure with a cancellation signal.
    pub async fn call_with_signal<P: Procedure>(
        &self,
        input: &P::Input,
        signal: CancellationToken,
    ) -> Result<P::Output, RpcError> {
        let call = self.build_call::<P>(input)?.with_signal(signal);
        self.send(call).await?.decode()
    }

    /// Invoke a streaming procedure, returning the raw response.
    pub async fn open<P: Procedure>(&self, input: &P::Input) -> Result<Response, RpcError> {
        let call = self.build_call::<P>(input)?;
        self.send(call).await
    }

    /// Invoke a streaming procedure and decode each item.
    pub async fn stream<P: Procedure>(
        &self,
        input: &P::Input,
    ) -> Result<TypedStream<P::Output>, RpcError> {
        let response = self.open::<P>(input).await?;
        Ok(decode_stream(response))
    }
}

/// Decode every item of a response stream into `T`.
pub fn decode_stream<T>(response: Response) -> TypedStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    response
        .into_stream()
        .map(|item| item.and_then(|payload| decode_payload(&payload)))
        .boxed()
}
