//! # Call timing
//!
//! [`TimingLayer`] is a `tower` layer that measures the wall-clock duration of
//! every gRPC call passing through it and hands a [`CallRecord`] to a
//! [`CallObserver`]. The same layer wraps the server router and the client
//! channel; only the [`Side`] recorded differs.
//!
//! The clock starts right before the request is delegated to the inner
//! service and stops when the call reaches a terminal state:
//!
//! - the response body yields its trailers frame (normal end of any call),
//! - the response head already carries `grpc-status` (trailers-only response),
//! - the inner service or the response body fails,
//! - the response body is dropped before finishing (cancellation).
//!
//! Response frames are forwarded as-is and errors propagate unchanged. Each
//! call produces exactly one record.

use crate::common::shape::{CallShape, shape_of};
use core::{
    fmt,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::{sync::Arc, time::Instant};
use tonic::Code;
use tower::{Layer, Service};

/// Which end of the call the layer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a timed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed with `grpc-status: 0`.
    Ok,
    /// Completed with a non-OK status.
    Status(Code),
    /// The transport or the inner service failed.
    Error,
    /// The response was dropped before the call finished.
    Cancelled,
}

impl Outcome {
    /// Reads `grpc-status` from a header or trailer block.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let raw = headers.get("grpc-status")?;
        let code = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .map_or(Code::Unknown, Code::from_i32);
        Some(match code {
            Code::Ok => Self::Ok,
            other => Self::Status(other),
        })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Status(code) => write!(f, "{code:?}"),
            Self::Error => f.write_str("error"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One finished call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub side: Side,
    /// Full method path, e.g. `/echo.Echo/Square`.
    pub method: String,
    /// `None` for paths that are not registered in [`crate::shape`].
    pub shape: Option<CallShape>,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

impl CallRecord {
    pub fn shape_label(&self) -> &'static str {
        self.shape.map_or("unknown", CallShape::label)
    }
}

/// Sink for call records. Implementations are invoked concurrently from
/// any task and must not block.
pub trait CallObserver: Send + Sync + 'static {
    fn observe(&self, record: CallRecord);
}

impl<F> CallObserver for F
where
    F: Fn(CallRecord) + Send + Sync + 'static,
{
    fn observe(&self, record: CallRecord) {
        self(record)
    }
}

/// Reports every call as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl CallObserver for LogObserver {
    fn observe(&self, record: CallRecord) {
        tracing::info!(
            side = record.side.as_str(),
            method = %record.method,
            outcome = %record.outcome,
            elapsed = ?record.elapsed,
            "{} query cost",
            record.shape_label()
        );
    }
}

/// Running clock for one call. Reports [`Outcome::Cancelled`] if dropped
/// before [`CallTimer::finish`].
pub struct CallTimer {
    side: Side,
    method: String,
    shape: Option<CallShape>,
    started: Instant,
    observer: Arc<dyn CallObserver>,
    reported: bool,
}

impl CallTimer {
    pub fn start(side: Side, method: impl Into<String>, observer: Arc<dyn CallObserver>) -> Self {
        let method = method.into();
        let shape = shape_of(&method);
        Self {
            side,
            method,
            shape,
            started: Instant::now(),
            observer,
            reported: false,
        }
    }

    pub fn finish(mut self, outcome: Outcome) {
        self.report(outcome);
    }

    fn report(&mut self, outcome: Outcome) {
        if self.reported {
            return;
        }
        self.reported = true;
        self.observer.observe(CallRecord {
            side: self.side,
            method: core::mem::take(&mut self.method),
            shape: self.shape,
            elapsed: self.started.elapsed(),
            outcome,
        });
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.report(Outcome::Cancelled);
    }
}

impl fmt::Debug for CallTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTimer")
            .field("side", &self.side)
            .field("method", &self.method)
            .field("shape", &self.shape)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// Layer that times every call through the wrapped service.
#[derive(Clone)]
pub struct TimingLayer {
    side: Side,
    observer: Arc<dyn CallObserver>,
}

impl TimingLayer {
    pub fn new(side: Side, observer: impl CallObserver) -> Self {
        Self {
            side,
            observer: Arc::new(observer),
        }
    }

    pub fn from_arc(side: Side, observer: Arc<dyn CallObserver>) -> Self {
        Self { side, observer }
    }
}

impl fmt::Debug for TimingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimingLayer")
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for TimingLayer {
    type Service = Timing<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Timing {
            inner,
            side: self.side,
            observer: Arc::clone(&self.observer),
        }
    }
}

/// Service produced by [`TimingLayer`].
#[derive(Clone)]
pub struct Timing<S> {
    inner: S,
    side: Side,
    observer: Arc<dyn CallObserver>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Timing<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = http::Response<TimedBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let timer = CallTimer::start(self.side, req.uri().path(), Arc::clone(&self.observer));
        ResponseFuture {
            inner: self.inner.call(req),
            timer: Some(timer),
        }
    }
}

pin_project! {
    /// Response future for [`Timing`].
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        timer: Option<CallTimer>,
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<http::Response<B>, E>>,
{
    type Output = Result<http::Response<TimedBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        let timer = this.timer.take();

        Poll::Ready(match result {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                // Trailers-only responses carry the status in the head and
                // end without a trailers frame.
                let timer = match (timer, Outcome::from_headers(&parts.headers)) {
                    (Some(timer), Some(outcome)) => {
                        timer.finish(outcome);
                        None
                    }
                    (timer, _) => timer,
                };
                Ok(http::Response::from_parts(
                    parts,
                    TimedBody { inner: body, timer },
                ))
            }
            Err(err) => {
                if let Some(timer) = timer {
                    timer.finish(Outcome::Error);
                }
                Err(err)
            }
        })
    }
}

pin_project! {
    /// Response body that stops the call timer at end of stream.
    pub struct TimedBody<B> {
        #[pin]
        inner: B,
        timer: Option<CallTimer>,
    }
}

impl<B: Body> Body for TimedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        let outcome = match &frame {
            Some(Ok(frame)) => frame
                .trailers_ref()
                .map(|trailers| Outcome::from_headers(trailers).unwrap_or(Outcome::Ok)),
            Some(Err(_)) => Some(Outcome::Error),
            None => Some(Outcome::Ok),
        };
        if let Some(outcome) = outcome {
            if let Some(timer) = this.timer.take() {
                timer.finish(outcome);
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
