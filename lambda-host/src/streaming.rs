//! Chunked streaming responses.
//!
//! A handler that wants to emit a streaming response returns
//! `Result<StreamResponse<Body>, Error>` (or a plain `StreamResponse<Body>`
//! via the [`IntoFunctionResponse`](crate::types::IntoFunctionResponse)
//! impl), where `Body` is this module's channel-backed byte stream.

pub use lambda_host_api_client::body::Body;
use lambda_host_api_client::BoxError;

pub use crate::types::StreamResponse as Response;

/// Sender half of a [`channel`], used to push chunks into a streaming
/// response body from another task.
pub type Sender = futures_channel::mpsc::Sender<Result<bytes::Bytes, BoxError>>;

/// Create a new `Body` stream with associated Sender half.
///
/// ```
/// use lambda_host::streaming::{channel, Response};
/// use lambda_host::Error;
/// use std::time::Duration;
///
/// async fn func(_event: serde_json::Value) -> Result<Response<lambda_host::streaming::Body>, Error> {
///     let messages = vec!["Hello", "world", "from", "the", "runtime", "host!"];
///
///     let (mut tx, rx) = channel();
///
///     tokio::spawn(async move {
///         for message in messages.iter() {
///             let _ = tx.try_send(Ok((message.to_string() + "\n").into()));
///             tokio::time::sleep(Duration::from_millis(50)).await;
///         }
///     });
///
///     Ok(Response::from(rx))
/// }
/// ```
#[inline]
pub fn channel() -> (Sender, Body) {
    Body::channel()
}
