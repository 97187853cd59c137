//! Server layer that writes handler-supplied trailing metadata.
//!
//! Handlers attach a [`TrailingMetadata`] extension to their response; this
//! layer lifts it off the response and appends its entries to the trailers
//! frame that ends the body, next to `grpc-status`. Calls that end with a
//! non-OK status never carry it.

use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use echo_rpc_core::{
    metadata::{TrailingMetadata, merge_into},
    timing::Outcome,
};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tonic::metadata::MetadataMap;
use tower::{Layer, Service};

#[derive(Debug, Clone, Copy, Default)]
pub struct TrailersLayer;

impl<S> Layer<S> for TrailersLayer {
    type Service = Trailers<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Trailers { inner }
    }
}

#[derive(Debug, Clone)]
pub struct Trailers<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Trailers<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = http::Response<WithTrailers<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        ResponseFuture {
            inner: self.inner.call(req),
        }
    }
}

pin_project! {
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<http::Response<B>, E>>,
{
    type Output = Result<http::Response<WithTrailers<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut response = ready!(self.project().inner.poll(cx))?;
        let pending = response
            .extensions_mut()
            .remove::<TrailingMetadata>()
            .map(TrailingMetadata::into_inner);
        Poll::Ready(Ok(response.map(|inner| WithTrailers { inner, pending })))
    }
}

pin_project! {
    pub struct WithTrailers<B> {
        #[pin]
        inner: B,
        pending: Option<MetadataMap>,
    }
}

impl<B: Body> Body for WithTrailers<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let mut frame = ready!(this.inner.poll_frame(cx));

        if let Some(Ok(frame)) = frame.as_mut() {
            if let Some(trailers) = frame.trailers_mut() {
                if let Some(metadata) = this.pending.take() {
                    if succeeded(trailers) {
                        merge_into(trailers, metadata);
                    }
                }
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn succeeded(trailers: &http::HeaderMap) -> bool {
    Outcome::from_headers(trailers) == Some(Outcome::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};
    use std::{collections::VecDeque, convert::Infallible, future::poll_fn};
    use tonic::metadata::MetadataValue;
    use tower::ServiceExt;

    struct FrameBody(VecDeque<Frame<&'static [u8]>>);

    impl Body for FrameBody {
        type Data = &'static [u8];
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Ready(self.0.pop_front().map(Ok))
        }
    }

    fn grpc_body() -> FrameBody {
        grpc_body_with_status("0")
    }

    fn grpc_body_with_status(status: &'static str) -> FrameBody {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static(status));
        FrameBody(VecDeque::from([
            Frame::data(&b"payload"[..]),
            Frame::trailers(trailers),
        ]))
    }

    async fn trailers_of<B: Body + Unpin>(mut body: B) -> Option<HeaderMap> {
        while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
            if let Ok(trailers) = frame.ok()?.into_trailers() {
                return Some(trailers);
            }
        }
        None
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attached_metadata_lands_in_trailers() {
        let svc = TrailersLayer.layer(tower::service_fn(|_req: http::Request<()>| async {
            let mut response = tonic::Response::new(grpc_body());
            let mut trailing = MetadataMap::new();
            trailing.insert("retry", MetadataValue::from_static("false"));
            TrailingMetadata::attach(&mut response, trailing).unwrap();
            Ok::<_, Infallible>(response.into_http())
        }));

        let response = svc.oneshot(http::Request::new(())).await.unwrap();
        assert!(response.extensions().get::<TrailingMetadata>().is_none());

        let trailers = trailers_of(response.into_body()).await.unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
        assert_eq!(trailers.get("retry").unwrap(), "false");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_calls_keep_their_trailers_clean() {
        let svc = TrailersLayer.layer(tower::service_fn(|_req: http::Request<()>| async {
            let mut response = tonic::Response::new(grpc_body_with_status("3"));
            let mut trailing = MetadataMap::new();
            trailing.insert("retry", MetadataValue::from_static("false"));
            TrailingMetadata::attach(&mut response, trailing).unwrap();
            Ok::<_, Infallible>(response.into_http())
        }));

        let response = svc.oneshot(http::Request::new(())).await.unwrap();
        let trailers = trailers_of(response.into_body()).await.unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "3");
        assert!(trailers.get("retry").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn responses_without_metadata_pass_through() {
        let svc = TrailersLayer.layer(tower::service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(http::Response::new(grpc_body()))
        }));

        let response = svc.oneshot(http::Request::new(())).await.unwrap();
        let trailers = trailers_of(response.into_body()).await.unwrap();
        assert_eq!(trailers.len(), 1);
    }
}
