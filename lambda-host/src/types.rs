//! Response-shape types produced by the Handler Composer and consumed by
//! the Runtime API Client when posting `/response`.

use http::HeaderMap;
use serde::Serialize;

/// What the composed handler produced, ready to be posted back to the
/// Runtime API.
pub enum FunctionResponse<B, S> {
    /// A single JSON-serializable value, posted as one `/response` body.
    Buffered(B),
    /// A chunked stream of bytes, posted with
    /// `Lambda-Runtime-Function-Response-Mode: streaming`.
    Streaming(StreamResponse<S>),
}

/// A streaming response: a byte stream plus the prelude metadata the
/// orchestrator expects as the first chunk.
pub struct StreamResponse<S> {
    /// The response body stream.
    pub stream: S,
    /// Status code and headers sent ahead of the stream body.
    pub metadata_prelude: MetadataPrelude,
}

/// Metadata sent as the first frame of a streaming response.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataPrelude {
    /// HTTP-style status code surfaced to the invoker, when applicable.
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Response headers.
    #[serde(with = "http_serde::header_map")]
    pub headers: HeaderMap,
    /// Cookies to attach to the response, kept separate from `headers`
    /// because the orchestrator wire format lists them independently.
    pub cookies: Vec<String>,
}

impl<S> StreamResponse<S> {
    /// Wraps a stream with a default (200, no extra headers) prelude.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            metadata_prelude: MetadataPrelude::default(),
        }
    }
}

impl<S> From<S> for StreamResponse<S> {
    fn from(stream: S) -> Self {
        Self::new(stream)
    }
}

impl Default for MetadataPrelude {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
        }
    }
}

/// Converts a handler's return value into the uniform [`FunctionResponse`]
/// shape the loop knows how to post. Implemented for plain serializable
/// values (as a buffered response); stream-producing handlers implement it
/// directly for their own return type.
pub trait IntoFunctionResponse<B, S> {
    /// Performs the conversion.
    fn into_function_response(self) -> FunctionResponse<B, S>;
}

impl<T, S> IntoFunctionResponse<T, S> for T
where
    T: Serialize,
{
    fn into_function_response(self) -> FunctionResponse<T, S> {
        FunctionResponse::Buffered(self)
    }
}

impl<S> IntoFunctionResponse<serde_json::Value, S> for StreamResponse<S> {
    fn into_function_response(self) -> FunctionResponse<serde_json::Value, S> {
        FunctionResponse::Streaming(self)
    }
}
