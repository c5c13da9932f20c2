use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use gatehouse_common::backends::headers::X_REQUEST_ID;
use http::{HeaderValue, Request};
use tower::{Layer, Service};
use uuid::Uuid;

/// The correlation id minted for one inbound request.
///
/// The gateway is the origin of correlation ids; an `X-Request-Id` a client
/// sends in is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

/// Mints a [`RequestId`] per request, exposes it as a request extension and
/// guarantees the `X-Request-Id` response header on every path. A header
/// already set further in (by a failure envelope) is left alone.
#[derive(Clone)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = Correlation<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Correlation { inner }
    }
}

#[derive(Clone)]
pub struct Correlation<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for Correlation<S>
where
    S: Service<Request<Body>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let request_id = RequestId(Uuid::new_v4());
        request.extensions_mut().insert(request_id);

        let future = self.inner.call(request);

        Box::pin(async move {
            let mut response = future.await?;

            if !response.headers().contains_key(&X_REQUEST_ID) {
                response.headers_mut().insert(
                    X_REQUEST_ID.clone(),
                    HeaderValue::from_str(&request_id.0.to_string())
                        .expect("a uuid is a valid header value"),
                );
            }

            Ok(response)
        })
    }
}
