//! Server-wide cap on calls in flight.
//!
//! A call takes a permit before it is dispatched and gives it back when its
//! response body ends or is dropped. Calls that stream their responses from
//! a background task therefore count for as long as they stream, not just
//! until their headers go out.

use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::PollSemaphore;
use tower::{Layer, Service};

#[derive(Debug, Clone)]
pub struct CallLimitLayer {
    semaphore: Arc<Semaphore>,
}

impl CallLimitLayer {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
        }
    }

    /// Permits not held by any call.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Layer<S> for CallLimitLayer {
    type Service = CallLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallLimit {
            inner,
            semaphore: PollSemaphore::new(Arc::clone(&self.semaphore)),
            permit: None,
        }
    }
}

pub struct CallLimit<S> {
    inner: S,
    semaphore: PollSemaphore,
    permit: Option<OwnedSemaphorePermit>,
}

// A clone starts without a permit of its own.
impl<S: Clone> Clone for CallLimit<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            semaphore: self.semaphore.clone(),
            permit: None,
        }
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for CallLimit<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = http::Response<LimitedBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.permit.is_none() {
            self.permit = ready!(self.semaphore.poll_acquire(cx));
            debug_assert!(self.permit.is_some(), "call semaphore is never closed");
        }
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        ResponseFuture {
            inner: self.inner.call(req),
            permit: self.permit.take(),
        }
    }
}

pin_project! {
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        permit: Option<OwnedSemaphorePermit>,
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<http::Response<B>, E>>,
{
    type Output = Result<http::Response<LimitedBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let response = ready!(this.inner.poll(cx))?;
        let permit = this.permit.take();
        Poll::Ready(Ok(response.map(|inner| LimitedBody { inner, permit })))
    }
}

pin_project! {
    /// Response body that owns its call's permit.
    pub struct LimitedBody<B> {
        #[pin]
        inner: B,
        permit: Option<OwnedSemaphorePermit>,
    }
}

impl<B: Body> Body for LimitedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        let ended = match &frame {
            None | Some(Err(_)) => true,
            Some(Ok(frame)) => frame.is_trailers(),
        };
        if ended {
            this.permit.take();
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

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use std::{collections::VecDeque, convert::Infallible, future::poll_fn, time::Duration};
    use tower::ServiceExt;

    /// Yields its frames, then stays open until dropped if `open` is set.
    struct FrameBody {
        frames: VecDeque<Frame<&'static [u8]>>,
        open: bool,
    }

    impl Body for FrameBody {
        type Data = &'static [u8];
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            match self.frames.pop_front() {
                Some(frame) => Poll::Ready(Some(Ok(frame))),
                None if self.open => Poll::Pending,
                None => Poll::Ready(None),
            }
        }
    }

    fn streaming() -> FrameBody {
        FrameBody {
            frames: VecDeque::from([Frame::data(&b"first"[..])]),
            open: true,
        }
    }

    fn finished() -> FrameBody {
        FrameBody {
            frames: VecDeque::from([
                Frame::data(&b"only"[..]),
                Frame::trailers(HeaderMap::new()),
            ]),
            open: false,
        }
    }

    async fn next_frame<B: Body + Unpin>(body: &mut B) -> Option<Frame<B::Data>> {
        poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx))
            .await
            .and_then(|frame| frame.ok())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_body_keeps_the_permit() {
        let layer = CallLimitLayer::new(1);
        let svc = layer.layer(tower::service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(http::Response::new(streaming()))
        }));

        let mut body = svc
            .clone()
            .oneshot(http::Request::new(()))
            .await
            .unwrap()
            .into_body();
        assert!(next_frame(&mut body).await.unwrap().is_data());
        assert_eq!(layer.available(), 0);

        let mut queued = svc.clone();
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            ServiceExt::<http::Request<()>>::ready(&mut queued),
        )
        .await;
        assert!(blocked.is_err());

        drop(body);
        let ready = tokio::time::timeout(
            Duration::from_secs(5),
            ServiceExt::<http::Request<()>>::ready(&mut queued),
        )
        .await;
        assert!(matches!(ready, Ok(Ok(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trailers_release_the_permit() {
        let layer = CallLimitLayer::new(1);
        let svc = layer.layer(tower::service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(http::Response::new(finished()))
        }));

        let mut body = svc
            .oneshot(http::Request::new(()))
            .await
            .unwrap()
            .into_body();
        assert_eq!(layer.available(), 0);

        assert!(next_frame(&mut body).await.unwrap().is_data());
        assert_eq!(layer.available(), 0);
        assert!(next_frame(&mut body).await.unwrap().is_trailers());
        assert_eq!(layer.available(), 1);
    }
}
