//! Client layer that exposes a call's metadata apart from its response body.
//!
//! A caller attaches a [`CallMetadata`] handle to the outgoing request. The
//! [`CaptureLayer`] fills it in as the call progresses: initial metadata when
//! the response head arrives, trailing metadata when the trailers frame goes
//! by. Either side can be awaited before, during or after the body is read.
//!
//! The layer also counts calls in flight and ends them when the owning
//! channel is closed: open bodies yield `CANCELLED`, and calls still waiting
//! for their head fail with a boxed `CANCELLED` status, which tonic surfaces
//! as that status.

use core::{
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
    task::{Context, Poll, ready},
};
use echo_rpc_core::{metadata::from_headers, timing::Outcome};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::{Status, metadata::MetadataMap};
use tower::{BoxError, Layer, Service};

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Pending,
    Received(MetadataMap),
    Missing,
}

impl Slot {
    fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn metadata(&self) -> Option<MetadataMap> {
        match self {
            Self::Received(metadata) => Some(metadata.clone()),
            Self::Pending | Self::Missing => None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    initial: watch::Sender<Slot>,
    trailing: watch::Sender<Slot>,
}

/// Handle to the initial and trailing metadata of one call.
///
/// Each side is written at most once. A side the call never produced (the
/// call failed before the head, or ended without trailers) resolves to
/// `None`.
#[derive(Debug, Clone)]
pub struct CallMetadata {
    shared: Arc<Shared>,
}

impl Default for CallMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMetadata {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                initial: watch::Sender::new(Slot::Pending),
                trailing: watch::Sender::new(Slot::Pending),
            }),
        }
    }

    /// Creates a handle and attaches it to `request`.
    pub fn attach<T>(request: &mut tonic::Request<T>) -> Self {
        let metadata = Self::new();
        request.extensions_mut().insert(metadata.clone());
        metadata
    }

    /// Initial metadata, if it has arrived.
    pub fn initial(&self) -> Option<MetadataMap> {
        self.shared.initial.borrow().metadata()
    }

    /// Trailing metadata, if the call has ended with trailers.
    pub fn trailing(&self) -> Option<MetadataMap> {
        self.shared.trailing.borrow().metadata()
    }

    /// Waits for the response head.
    pub async fn initial_metadata(&self) -> Option<MetadataMap> {
        settled(&self.shared.initial).await
    }

    /// Waits for the call to reach a terminal state.
    pub async fn trailing_metadata(&self) -> Option<MetadataMap> {
        settled(&self.shared.trailing).await
    }

    fn set_initial(&self, metadata: MetadataMap) {
        settle(&self.shared.initial, Slot::Received(metadata));
    }

    fn set_trailing(&self, metadata: MetadataMap) {
        settle(&self.shared.trailing, Slot::Received(metadata));
    }

    fn abandon(&self) {
        settle(&self.shared.initial, Slot::Missing);
        settle(&self.shared.trailing, Slot::Missing);
    }
}

async fn settled(sender: &watch::Sender<Slot>) -> Option<MetadataMap> {
    let mut receiver = sender.subscribe();
    let slot = receiver.wait_for(Slot::is_settled).await.ok()?;
    slot.metadata()
}

fn settle(sender: &watch::Sender<Slot>, value: Slot) {
    let mut value = Some(value);
    sender.send_if_modified(|slot| match (slot.is_settled(), value.take()) {
        (false, Some(value)) => {
            *slot = value;
            true
        }
        _ => false,
    });
}

/// Marks whatever the call did not produce as missing when dropped.
#[derive(Debug)]
struct Recorder(CallMetadata);

impl Drop for Recorder {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

#[derive(Debug)]
struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Layer producing [`Capture`]. Clones share the in-flight counter and the
/// close signal.
#[derive(Debug, Clone, Default)]
pub struct CaptureLayer {
    closing: CancellationToken,
    inflight: Arc<AtomicUsize>,
}

impl CaptureLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls started and not yet finished.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Ends every call in flight with `CANCELLED`. Calls made afterwards
    /// are cancelled immediately.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = Capture<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Capture {
            inner,
            closing: self.closing.clone(),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Capture<S> {
    inner: S,
    closing: CancellationToken,
    inflight: Arc<AtomicUsize>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Capture<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Error: Into<BoxError>,
{
    type Response = http::Response<CaptureBody<ResBody>>;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let recorder = req.extensions().get::<CallMetadata>().cloned().map(Recorder);
        let call = CallState {
            recorder,
            guard: InflightGuard::new(&self.inflight),
            closing: Box::pin(self.closing.clone().cancelled_owned()),
        };
        ResponseFuture {
            inner: self.inner.call(req),
            call: Some(call),
        }
    }
}

struct CallState {
    recorder: Option<Recorder>,
    guard: InflightGuard,
    closing: Pin<Box<WaitForCancellationFutureOwned>>,
}

pin_project! {
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        call: Option<CallState>,
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<http::Response<B>, E>>,
    E: Into<BoxError>,
{
    type Output = Result<http::Response<CaptureBody<B>>, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let response = match this.inner.poll(cx) {
            Poll::Ready(Ok(response)) => response,
            Poll::Ready(Err(err)) => {
                this.call.take();
                return Poll::Ready(Err(err.into()));
            }
            Poll::Pending => {
                let Some(call) = this.call.as_mut() else {
                    return Poll::Pending;
                };
                ready!(call.closing.as_mut().poll(cx));
                this.call.take();
                let closed: BoxError = Box::new(Status::cancelled("channel closed"));
                return Poll::Ready(Err(closed));
            }
        };

        let (parts, body) = response.into_parts();
        let Some(call) = this.call.take() else {
            return Poll::Ready(Ok(http::Response::from_parts(
                parts,
                CaptureBody::finished(body),
            )));
        };

        if let Some(Recorder(metadata)) = &call.recorder {
            // Trailers-only: the head is the trailers and there was no
            // initial metadata.
            if Outcome::from_headers(&parts.headers).is_some() {
                metadata.set_initial(MetadataMap::new());
                metadata.set_trailing(from_headers(&parts.headers));
            } else {
                metadata.set_initial(from_headers(&parts.headers));
            }
        }

        Poll::Ready(Ok(http::Response::from_parts(
            parts,
            CaptureBody {
                inner: body,
                call: Some(call),
                done: false,
            },
        )))
    }
}

pin_project! {
    /// Response body that records trailing metadata and ends early when the
    /// channel closes.
    pub struct CaptureBody<B> {
        #[pin]
        inner: B,
        call: Option<CallState>,
        done: bool,
    }
}

impl<B> CaptureBody<B> {
    fn finished(inner: B) -> Self {
        Self {
            inner,
            call: None,
            done: false,
        }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body,
    B::Error: From<Status>,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        if let Some(call) = this.call.as_mut() {
            if call.closing.as_mut().poll(cx).is_ready() {
                this.call.take();
                *this.done = true;
                return Poll::Ready(Some(Err(Status::cancelled("channel closed").into())));
            }
        }

        let frame = ready!(this.inner.poll_frame(cx));
        match &frame {
            Some(Ok(frame)) => {
                if let Some(trailers) = frame.trailers_ref() {
                    if let Some(call) = this.call.take() {
                        if let Some(Recorder(metadata)) = &call.recorder {
                            metadata.set_trailing(from_headers(trailers));
                        }
                    }
                }
            }
            Some(Err(_)) | None => {
                this.call.take();
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, header::CONTENT_TYPE};
    use std::{collections::VecDeque, convert::Infallible, future::poll_fn, time::Duration};
    use tower::ServiceExt;

    #[derive(Default)]
    struct FrameBody {
        frames: VecDeque<Frame<Bytes>>,
        stall: bool,
    }

    impl Body for FrameBody {
        type Data = Bytes;
        type Error = Status;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            match self.frames.pop_front() {
                Some(frame) => Poll::Ready(Some(Ok(frame))),
                None if self.stall => Poll::Pending,
                None => Poll::Ready(None),
            }
        }
    }

    fn grpc_response(stall: bool) -> http::Response<FrameBody> {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.insert("retry", HeaderValue::from_static("false"));

        let mut frames = VecDeque::from([Frame::data(Bytes::from_static(b"unit"))]);
        if !stall {
            frames.push_back(Frame::trailers(trailers));
        }

        let mut response = http::Response::new(FrameBody { frames, stall });
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        response.headers_mut().insert("c", HeaderValue::from_static("3"));
        response
    }

    fn request_with(metadata: &CallMetadata) -> http::Request<()> {
        let mut request = http::Request::new(());
        request.extensions_mut().insert(metadata.clone());
        request
    }

    async fn drain<B: Body + Unpin>(mut body: B) -> Vec<Result<Frame<B::Data>, B::Error>> {
        let mut frames = Vec::new();
        while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initial_before_body_and_trailing_after() {
        let layer = CaptureLayer::new();
        let svc = layer.layer(tower::service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(grpc_response(false))
        }));

        let metadata = CallMetadata::new();
        let response = svc.oneshot(request_with(&metadata)).await.unwrap();

        assert_eq!(metadata.initial().unwrap().get("c").unwrap(), "3");
        assert!(metadata.initial().unwrap().get("content-type").is_none());
        assert!(metadata.trailing().is_none());
        assert_eq!(layer.inflight(), 1);

        let frames = drain(response.into_body()).await;
        assert_eq!(frames.len(), 2);

        let trailing = metadata.trailing_metadata().await.unwrap();
        assert_eq!(trailing.get("retry").unwrap(), "false");
        assert!(trailing.get("grpc-status").is_none());
        assert_eq!(layer.inflight(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trailers_only_response_fills_both_sides() {
        let svc = CaptureLayer::new().layer(tower::service_fn(|_req: http::Request<()>| async {
            let mut response = http::Response::new(FrameBody::default());
            response
                .headers_mut()
                .insert("grpc-status", HeaderValue::from_static("3"));
            response.headers_mut().insert("why", HeaderValue::from_static("bad"));
            Ok::<_, Infallible>(response)
        }));

        let metadata = CallMetadata::new();
        let _response = svc.oneshot(request_with(&metadata)).await.unwrap();

        assert!(metadata.initial_metadata().await.unwrap().is_empty());
        let trailing = metadata.trailing_metadata().await.unwrap();
        assert_eq!(trailing.get("why").unwrap(), "bad");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_calls_resolve_to_missing() {
        let svc = CaptureLayer::new().layer(tower::service_fn(|_req: http::Request<()>| async {
            Err::<http::Response<FrameBody>, _>("connection refused")
        }));

        let metadata = CallMetadata::new();
        assert!(svc.oneshot(request_with(&metadata)).await.is_err());
        assert!(metadata.initial_metadata().await.is_none());
        assert!(metadata.trailing_metadata().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_body_leaves_trailing_missing() {
        let svc = CaptureLayer::new().layer(tower::service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(grpc_response(true))
        }));

        let metadata = CallMetadata::new();
        let response = svc.oneshot(request_with(&metadata)).await.unwrap();
        drop(response);

        assert!(metadata.initial().is_some());
        assert!(metadata.trailing_metadata().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_cancels_open_streams() {
        let layer = CaptureLayer::new();
        let svc = layer.layer(tower::service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(grpc_response(true))
        }));

        let response = svc.oneshot(http::Request::new(())).await.unwrap();
        let mut body = response.into_body();
        let first = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
        assert!(first.unwrap().unwrap().is_data());

        let closer = layer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.close();
        });

        let next = tokio::time::timeout(
            Duration::from_secs(5),
            poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)),
        )
        .await
        .unwrap();
        let status = next.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
        assert!(poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await.is_none());
        assert_eq!(layer.inflight(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_channel_answers_pending_calls() {
        let layer = CaptureLayer::new();
        let svc = layer.layer(tower::service_fn(|_req: http::Request<()>| async {
            std::future::pending::<Result<http::Response<FrameBody>, Infallible>>().await
        }));

        layer.close();
        let err = tokio::time::timeout(Duration::from_secs(5), svc.oneshot(http::Request::new(())))
            .await
            .unwrap()
            .err()
            .unwrap();
        let status = err.downcast_ref::<Status>().unwrap();
        assert_eq!(status.code(), tonic::Code::Cancelled);
        assert_eq!(layer.inflight(), 0);
    }
}
