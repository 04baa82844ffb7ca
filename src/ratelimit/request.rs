//! HTTP convenience wrappers around [`Gate::dispatch`].

use bytes::Bytes;
use http::{header, Method, Request};

use super::context::CallContext;
use super::gate::Gate;
use super::sender::Sender;
use crate::error::DispatchError;

/// Build a request with an optional `Content-Type` header.
pub fn build_request(
    method: Method,
    url: &str,
    content_type: Option<&str>,
    body: Bytes,
) -> Result<Request<Bytes>, http::Error> {
    let mut builder = Request::builder().method(method).uri(url);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(body)
}

impl<S> Gate<S>
where
    S: Sender<Request = Request<Bytes>>,
{
    /// Send a `GET` for `url` through the gate.
    pub async fn get(
        &self,
        ctx: &CallContext,
        url: &str,
    ) -> Result<S::Response, DispatchError<S::Error>> {
        let request = build_request(Method::GET, url, None, Bytes::new())
            .map_err(DispatchError::InvalidRequest)?;
        self.dispatch(ctx, request).await
    }

    /// Send a `POST` of `body` to `url` through the gate.
    pub async fn post(
        &self,
        ctx: &CallContext,
        url: &str,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<S::Response, DispatchError<S::Error>> {
        let request = build_request(Method::POST, url, Some(content_type), body.into())
            .map_err(DispatchError::InvalidRequest)?;
        self.dispatch(ctx, request).await
    }
}
