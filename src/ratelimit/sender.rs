//! Sender trait for abstracting the transport behind the gate.

use std::sync::Arc;

use async_trait::async_trait;

/// The outbound client the gate decorates.
///
/// The gate never inspects requests or responses, and never retries a
/// failed send.
#[async_trait]
pub trait Sender: Send + Sync {
    /// The prepared request type.
    type Request: Send + 'static;
    /// The response type returned on success.
    type Response: Send;
    /// The transport error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a single request.
    async fn send(&self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

#[async_trait]
impl<T: Sender> Sender for Arc<T> {
    type Request = T::Request;
    type Response = T::Response;
    type Error = T::Error;

    async fn send(&self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        (**self).send(request).await
    }
}
