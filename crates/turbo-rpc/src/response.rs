//! Upstream responses: a one-shot payload or a lazy stream of payloads.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::RpcError;

/// Opaque response payload.
///
/// Shared by reference: every caller coalesced into one call observes the
/// same allocation.
pub type Payload = Arc<Value>;

/// A lazy, possibly infinite sequence of payloads.
pub type ResponseStream = BoxStream<'static, Result<Payload, RpcError>>;

/// Result of an upstream call.
pub enum Response {
    /// A single value.
    Value(Payload),
    /// An open-ended sequence of values.
    Stream(ResponseStream),
}

impl Response {
    /// Wrap a JSON value.
    pub fn value(value: Value) -> Self {
        Response::Value(Arc::new(value))
    }

    /// Wrap any stream of payloads.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Payload, RpcError>> + Send + 'static,
    {
        Response::Stream(stream.boxed())
    }

    /// Whether this is a streamed response.
    pub fn is_stream(&self) -> bool {
        matches!(self, Response::Stream(_))
    }

    /// Take the one-shot payload.
    pub fn into_value(self) -> Result<Payload, RpcError> {
        match self {
            Response::Value(payload) => Ok(payload),
            Response::Stream(_) => Err(RpcError::Decode(
                "expected a value, got a stream".to_string(),
            )),
        }
    }

    /// Take the response as a stream; a one-shot value yields a single item.
    pub fn into_stream(self) -> ResponseStream {
        match self {
            Response::Value(payload) => stream::once(async move { Ok(payload) }).boxed(),
            Response::Stream(stream) => stream,
        }
    }

    /// Decode the one-shot payload into a typed value.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let payload = self.into_value()?;
        decode_payload(&payload)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(payload) => f.debug_tuple("Value").field(payload).finish(),
            Response::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Decode a payload without cloning the underlying value.
pub fn decode_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, RpcError> {
    T::deserialize(payload.as_ref()).map_err(RpcError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_value_rejects_stream() {
        let response = Response::stream(stream::empty());
        assert!(response.is_stream());
        assert!(matches!(response.into_value(), Err(RpcError::Decode(_))));
    }

    #[test]
    fn test_decode_value() {
        let response = Response::value(json!([{"name": "Mars"}]));
        let names: Vec<std::collections::HashMap<String, String>> = response.decode().unwrap();
        assert_eq!(names[0]["name"], "Mars");
    }

    #[test]
    fn test_decode_type_mismatch() {
        let response = Response::value(json!("not a number"));
        let result: Result<u32, _> = response.decode();
        assert!(matches!(result, Err(RpcError::Decode(_))));
    }

    #[tokio::test]
    async fn test_value_as_single_item_stream() {
        let items: Vec<_> = Response::value(json!(7)).into_stream().collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(*items[0].as_ref().unwrap().as_ref(), json!(7));
    }
}
