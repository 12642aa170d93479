use std::{fmt::Debug, str::FromStr};

use bytes::Bytes;
use http::{header::CONTENT_TYPE, Method, Request, Response, Uri};
use lambda_host_api_client::{body::Body, build_request};
use serde::Serialize;
use tokio_stream::Stream;

use crate::{
    diagnostic::Diagnostic,
    types::{FunctionResponse, IntoFunctionResponse},
    Error,
};

pub(crate) trait IntoRequest {
    fn into_req(self) -> Result<Request<Body>, Error>;
}

pub(crate) trait IntoResponse {
    fn into_rsp(self) -> Result<Response<Body>, Error>;
}

/// `GET /runtime/invocation/next`.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct NextEventRequest;

impl IntoRequest for NextEventRequest {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let req = build_request()
            .method(Method::GET)
            .uri(Uri::from_static("/2018-06-01/runtime/invocation/next"))
            .body(Body::empty())?;
        Ok(req)
    }
}

/// The loopback test harness's answer to a `NextEventRequest`.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct NextEventResponse<'a> {
    pub request_id: &'a str,
    pub deadline: u64,
    pub arn: &'a str,
    pub trace_id: &'a str,
    pub body: Vec<u8>,
}

impl<'a> IntoResponse for NextEventResponse<'a> {
    fn into_rsp(self) -> Result<Response<Body>, Error> {
        let rsp = Response::builder()
            .header("lambda-runtime-aws-request-id", self.request_id)
            .header("lambda-runtime-deadline-ms", self.deadline)
            .header("lambda-runtime-invoked-function-arn", self.arn)
            .header("lambda-runtime-trace-id", self.trace_id)
            .body(Body::from(self.body))?;
        Ok(rsp)
    }
}

/// `POST /runtime/invocation/{request_id}/response`.
pub(crate) struct EventCompletionRequest<'a, R, B, S> {
    pub(crate) request_id: &'a str,
    pub(crate) body: R,
    pub(crate) _unused_b: std::marker::PhantomData<B>,
    pub(crate) _unused_s: std::marker::PhantomData<S>,
}

impl<'a, R, B, S, D, E> IntoRequest for EventCompletionRequest<'a, R, B, S>
where
    R: IntoFunctionResponse<B, S>,
    B: Serialize,
    S: Stream<Item = Result<D, E>> + Unpin + Send + 'static,
    D: Into<Bytes> + Send,
    E: Into<Error> + Send + Debug,
{
    fn into_req(self) -> Result<Request<Body>, Error> {
        match self.body.into_function_response() {
            FunctionResponse::Buffered(body) => {
                let uri = format!("/2018-06-01/runtime/invocation/{}/response", self.request_id);
                let uri = Uri::from_str(&uri)?;
                let body = Body::from(serde_json::to_vec(&body)?);
                Ok(build_request().method(Method::POST).uri(uri).body(body)?)
            }
            FunctionResponse::Streaming(mut response) => {
                let uri = format!("/2018-06-01/runtime/invocation/{}/response", self.request_id);
                let uri = Uri::from_str(&uri)?;

                let mut builder = build_request().method(Method::POST).uri(uri);
                let req_headers = builder.headers_mut().expect("request builder has no error set yet");

                req_headers.insert("Transfer-Encoding", "chunked".parse()?);
                req_headers.insert("Lambda-Runtime-Function-Response-Mode", "streaming".parse()?);
                req_headers.append("Trailer", "Lambda-Runtime-Function-Error-Type".parse()?);
                req_headers.append("Trailer", "Lambda-Runtime-Function-Error-Body".parse()?);
                req_headers.insert(
                    "Content-Type",
                    "application/vnd.awslambda.http-integration-response".parse()?,
                );

                let prelude_headers = &mut response.metadata_prelude.headers;
                prelude_headers
                    .entry(CONTENT_TYPE)
                    .or_insert("application/octet-stream".parse()?);

                let metadata_prelude = serde_json::to_string(&response.metadata_prelude)?;
                tracing::trace!(?metadata_prelude);

                let body = Body::streaming_response(Bytes::from(metadata_prelude), response.stream);
                Ok(builder.body(body)?)
            }
        }
    }
}

/// `POST /runtime/invocation/{request_id}/error`.
pub(crate) struct EventErrorRequest<'a> {
    pub(crate) request_id: &'a str,
    pub(crate) diagnostic: Diagnostic,
}

impl<'a> EventErrorRequest<'a> {
    pub(crate) fn new(request_id: &'a str, diagnostic: Diagnostic) -> Self {
        Self { request_id, diagnostic }
    }
}

impl<'a> IntoRequest for EventErrorRequest<'a> {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let uri = format!("/2018-06-01/runtime/invocation/{}/error", self.request_id);
        let uri = Uri::from_str(&uri)?;
        let body = Body::from(serde_json::to_vec(&self.diagnostic)?);

        Ok(build_request()
            .method(Method::POST)
            .uri(uri)
            .header("lambda-runtime-function-error-type", "unhandled")
            .body(body)?)
    }
}

/// `POST /runtime/init/error`.
pub(crate) struct InitErrorRequest {
    pub(crate) diagnostic: Diagnostic,
}

impl InitErrorRequest {
    pub(crate) fn new(diagnostic: Diagnostic) -> Self {
        Self { diagnostic }
    }
}

impl IntoRequest for InitErrorRequest {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let uri = Uri::from_static("/2018-06-01/runtime/init/error");
        let body = Body::from(serde_json::to_vec(&self.diagnostic)?);

        Ok(build_request()
            .method(Method::POST)
            .uri(uri)
            .header("lambda-runtime-function-error-type", "unhandled")
            .body(body)?)
    }
}
