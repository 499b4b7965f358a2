//! Call data model and canonical equivalence key.

use std::collections::BTreeMap;
use std::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::RpcError;

/// HTTP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    /// Convert to HTTP method string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    /// Parse a method name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request headers.
///
/// Kept sorted by name, so two calls carrying the same headers in a
/// different insertion order have the same canonical form.
pub type Headers = BTreeMap<String, String>;

/// Request body.
pub enum Body {
    /// No body.
    Empty,
    /// Structured JSON body.
    Json(Value),
    /// Raw bytes (opaque).
    Binary(Vec<u8>),
    /// Form fields (opaque).
    Form(Vec<(String, String)>),
    /// Client-side stream of values (opaque).
    Stream(BoxStream<'static, Value>),
}

impl Body {
    /// Whether the body cannot be compared structurally.
    ///
    /// Calls with an opaque body are never coalesced.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Body::Binary(_) | Body::Form(_) | Body::Stream(_))
    }

    /// The JSON value of a structured body.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Body::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            Body::Form(fields) => f.debug_tuple("Form").field(fields).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Canonical equivalence key of a call.
///
/// Two calls are equivalent iff their keys are byte-equal. The key covers
/// method, URL, headers and body, never the cancellation signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey(String);

impl CallKey {
    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Field order is part of the canonical form.
#[derive(Serialize)]
struct CanonicalCall<'a> {
    body: Option<&'a Value>,
    headers: &'a Headers,
    method: Method,
    url: &'a str,
}

/// A single outbound call.
#[derive(Debug)]
pub struct Call {
    /// HTTP method.
    pub method: Method,
    /// Target URL, including any query string.
    pub url: String,
    /// Request headers.
    pub headers: Headers,
    /// Request body.
    pub body: Body,
    /// Caller cancellation signal.
    pub signal: Option<CancellationToken>,
}

impl Call {
    /// Create a new call with no headers and no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: Body::Empty,
            signal: None,
        }
    }

    /// Create a GET call.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Create a POST call.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Append a URL-encoded query parameter.
    pub fn query_param(mut self, name: &str, value: &str) -> Self {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let encoded: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(name, value)
            .finish();
        self.url.push(separator);
        self.url.push_str(&encoded);
        self
    }

    /// Set a JSON body.
    pub fn json(mut self, value: Value) -> Self {
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.body = Body::Json(value);
        self
    }

    /// Serialize a value into a JSON body.
    pub fn json_body<T: Serialize>(self, value: &T) -> Result<Self, RpcError> {
        let value = serde_json::to_value(value)?;
        Ok(self.json(value))
    }

    /// Set a raw byte body.
    pub fn binary(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Binary(bytes.into());
        self
    }

    /// Set a form body.
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Body::Form(fields);
        self
    }

    /// Set a streamed body.
    pub fn stream(mut self, stream: BoxStream<'static, Value>) -> Self {
        self.body = Body::Stream(stream);
        self
    }

    /// Attach a cancellation signal.
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Compute the canonical equivalence key.
    ///
    /// Returns `None` for calls that cannot be compared structurally.
    pub fn key(&self) -> Option<CallKey> {
        if self.body.is_opaque() {
            return None;
        }

        let canonical = CanonicalCall {
            body: self.body.as_json(),
            headers: &self.headers,
            method: self.method,
            url: &self.url,
        };

        serde_json::to_string(&canonical).ok().map(CallKey)
    }

    /// Check whether the caller has already cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.signal
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

/// Context handed to the transport for the rest of a call's lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    /// Name of the coalescing group the call was routed through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Arbitrary transport attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl CallContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context for a named group.
    pub fn for_group(name: impl Into<String>) -> Self {
        Self {
            group: Some(name.into()),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get an attribute by name.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_method_round_trip_names() {
        assert_eq!(Method::Get.as_str(), "GET");
        assert_eq!(Method::parse("post"), Some(Method::Post));
        assert_eq!(Method::parse("TRACE"), None);
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_equivalent_calls_share_key() {
        let a = Call::get("/rpc/planet/list").header("x-tenant", "a");
        let b = Call::get("/rpc/planet/list")
            .header("x-tenant", "a")
            .with_signal(CancellationToken::new());

        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_single_header_difference_changes_key() {
        let a = Call::get("/rpc/planet/list").header("x-tenant", "a");
        let b = Call::get("/rpc/planet/list").header("x-tenant", "b");

        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_header_insertion_order_is_ignored() {
        let a = Call::get("/items").header("a", "1").header("b", "2");
        let b = Call::get("/items").header("b", "2").header("a", "1");

        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_method_and_body_are_part_of_key() {
        let get = Call::get("/items");
        let post = Call::post("/items");
        assert_ne!(get.key(), post.key());

        let one = Call::post("/items").json(json!({"name": "Mars"}));
        let two = Call::post("/items").json(json!({"name": "Venus"}));
        assert_ne!(one.key(), two.key());
    }

    #[test]
    fn test_opaque_bodies_have_no_key() {
        assert!(Call::post("/upload").binary(vec![1, 2, 3]).key().is_none());
        assert!(Call::post("/form")
            .form(vec![("a".into(), "b".into())])
            .key()
            .is_none());
        let stream = futures::stream::empty::<Value>().boxed();
        assert!(Call::post("/stream").stream(stream).key().is_none());
    }

    #[test]
    fn test_query_param_encoding() {
        let call = Call::get("/items")
            .query_param("page", "2")
            .query_param("q", "red planet");

        assert_eq!(call.url, "/items?page=2&q=red+planet");
    }

    #[test]
    fn test_is_cancelled_follows_signal() {
        let token = CancellationToken::new();
        let call = Call::get("/items").with_signal(token.clone());
        assert!(!call.is_cancelled());
        token.cancel();
        assert!(call.is_cancelled());
        assert!(!Call::get("/items").is_cancelled());
    }

    #[test]
    fn test_call_context_attributes() {
        let ctx = CallContext::for_group("reads").with_attribute("tenant", "acme");

        assert_eq!(ctx.group.as_deref(), Some("reads"));
        assert_eq!(ctx.attribute("tenant"), Some("acme"));
        assert_eq!(ctx.attribute("missing"), None);
    }
}
