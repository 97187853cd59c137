//! gRPC service implementation for the four echo call shapes.
//!
//! This module defines [`EchoService`], the concrete implementation of the
//! [`Echo`] gRPC service generated from `echo.proto`.
//!
//! ## Call shapes
//!
//! - `Square` - unary in, unary out. Logs the inbound metadata, sends initial
//!   metadata `c: 3`, `d: 4` and trailing metadata `checksum-bin: "I agree"`,
//!   `retry: false`.
//! - `RangeSquare` - unary in, streamed out. A producer task feeds
//!   `0², 1², ..., (trunc(n + 1) - 1)²` into the response channel.
//! - `SumSquare` - streamed in, unary out. Sums the squares of every value.
//! - `StreamrangeSquare` - streamed in, streamed out. Same metadata as
//!   `Square`; the initial metadata goes out right away, then the whole
//!   request stream is read before the first square is emitted.
//!
//! ## Shutdown
//!
//! [`EchoService::shutdown`] refuses new calls, waits for in-flight response
//! streams to finish and then cancels whatever is still running.

use crate::server::{
    streaming::{
        consumer::for_each_value,
        producer::{ResponseSender, emit_all},
    },
    telemetry::{
        decrement_streams_inflight, increment_errors, increment_requests,
        increment_streams_inflight,
    },
};
use core::{pin::Pin, time::Duration};
use echo_rpc_core::{
    Error,
    echo::{RangeSquares, SumOfSquares, square},
    metadata::TrailingMetadata,
    proto::{Message, echo_server::Echo},
};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{
    Request, Response, Status, Streaming,
    metadata::{MetadataMap, MetadataValue},
};
use tracing::Instrument;

type ResponseStream = Pin<Box<dyn Stream<Item = Result<Message, Status>> + Send>>;

/// Initial metadata sent by `Square` and `StreamrangeSquare`.
pub const INITIAL_METADATA: [(&str, &str); 2] = [("c", "3"), ("d", "4")];

/// Trailing binary checksum sent by `Square` and `StreamrangeSquare`.
pub const CHECKSUM: &[u8] = b"I agree";

/// The echo service. Cheap to clone; clones share shutdown state and the
/// in-flight counter.
#[derive(Clone)]
pub struct EchoService {
    state: Arc<ServiceState>,
}

struct ServiceState {
    shutdown: CancellationToken,
    draining: AtomicBool,
    inflight: AtomicUsize,
    stream_buffer_size: usize,
    pid: u32,
}

/// Counts one in-flight stream for as long as it lives.
struct InflightGuard(Arc<ServiceState>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_streams_inflight();
    }
}

impl EchoService {
    /// Creates a service whose response streams buffer up to
    /// `stream_buffer_size` units ahead of the client.
    pub fn new(stream_buffer_size: usize) -> Self {
        Self {
            state: Arc::new(ServiceState {
                shutdown: CancellationToken::new(),
                draining: AtomicBool::new(false),
                inflight: AtomicUsize::new(0),
                stream_buffer_size: stream_buffer_size.max(1),
                pid: std::process::id(),
            }),
        }
    }

    /// Number of streams currently being consumed or produced.
    pub fn streams_inflight(&self) -> usize {
        self.state.inflight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.draining.load(Ordering::Acquire)
    }

    /// Stops accepting calls, waits for in-flight streams to drain (bounded
    /// by `drain_timeout` if given) and cancels anything left.
    pub async fn shutdown(&self, drain_timeout: Option<Duration>) {
        tracing::info!("Refusing new requests");
        self.state.draining.store(true, Ordering::Release);

        tracing::info!(
            "Draining in-flight streams ({} active)",
            self.streams_inflight()
        );
        let drain = async {
            while self.streams_inflight() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        match drain_timeout {
            Some(limit) => match tokio::time::timeout(limit, drain).await {
                Ok(()) => tracing::debug!("All in-flight streams drained successfully"),
                Err(_) => tracing::warn!(
                    "Graceful drain timed out ({} streams still active)",
                    self.streams_inflight()
                ),
            },
            None => drain.await,
        }

        tracing::debug!("Cancelling remaining work via shutdown token");
        self.state.shutdown.cancel();
    }

    fn admit(&self, method: &'static str) -> Result<(), Status> {
        if self.is_shutting_down() {
            increment_errors(method);
            return Err(Error::ServiceShutdown.into());
        }
        increment_requests(method);
        tracing::debug!(pid = self.state.pid, method, "call admitted");
        Ok(())
    }

    fn track(&self) -> InflightGuard {
        self.state.inflight.fetch_add(1, Ordering::AcqRel);
        increment_streams_inflight();
        InflightGuard(Arc::clone(&self.state))
    }

    fn response_channel(&self) -> (ResponseSender, ResponseStream) {
        let (tx, rx) = mpsc::channel(self.state.stream_buffer_size);
        let stream: ResponseStream = Box::pin(ReceiverStream::new(rx));
        (tx, stream)
    }

    fn spawn_producer<I>(&self, method: &'static str, values: I, resp_tx: ResponseSender)
    where
        I: IntoIterator<Item = f64> + Send + 'static,
        I::IntoIter: Send,
    {
        let guard = self.track();
        let shutdown = self.state.shutdown.clone();

        let fut = async move {
            let _guard = guard;
            report_stream(method, emit_all(values, resp_tx, shutdown).await);
        };
        tokio::spawn(fut.instrument(tracing::info_span!("streaming", method)));
    }
}

fn report_stream(method: &'static str, result: echo_rpc_core::Result<u64>) {
    match result {
        Ok(sent) => tracing::debug!(method, sent, "Stream complete"),
        Err(Error::RequestCancelled) => {
            increment_errors(method);
            tracing::debug!(method, "Client cancelled stream");
        }
        Err(e) => {
            increment_errors(method);
            tracing::warn!(method, "Stream aborted: {e}");
        }
    }
}

/// Sets the initial metadata on `response` and attaches its trailing
/// metadata.
fn attach_echo_metadata<T>(response: &mut Response<T>) -> Result<(), Status> {
    let initial = response.metadata_mut();
    for (key, value) in INITIAL_METADATA {
        initial.insert(key, MetadataValue::from_static(value));
    }

    let mut trailing = MetadataMap::new();
    trailing.insert_bin("checksum-bin", MetadataValue::from_bytes(CHECKSUM));
    trailing.insert("retry", MetadataValue::from_static("false"));
    TrailingMetadata::attach(response, trailing)?;
    Ok(())
}

#[tonic::async_trait]
impl Echo for EchoService {
    type RangeSquareStream = ResponseStream;
    type StreamrangeSquareStream = ResponseStream;

    async fn square(&self, request: Request<Message>) -> Result<Response<Message>, Status> {
        self.admit("Square")?;
        tracing::info!(metadata = ?request.metadata(), "Square invocation metadata");

        let value = request.into_inner().value;
        let mut response = Response::new(Message {
            value: square(value),
        });
        attach_echo_metadata(&mut response)?;
        Ok(response)
    }

    async fn range_square(
        &self,
        request: Request<Message>,
    ) -> Result<Response<Self::RangeSquareStream>, Status> {
        self.admit("RangeSquare")?;

        let range = RangeSquares::new(request.into_inner().value).inspect_err(|_| {
            increment_errors("RangeSquare");
        })?;
        let (resp_tx, stream) = self.response_channel();
        self.spawn_producer("RangeSquare", range, resp_tx);

        Ok(Response::new(stream))
    }

    async fn sum_square(
        &self,
        request: Request<Streaming<Message>>,
    ) -> Result<Response<Message>, Status> {
        self.admit("SumSquare")?;
        let _guard = self.track();

        let mut inbound = request.into_inner();
        let mut acc = SumOfSquares::default();
        for_each_value(&mut inbound, &self.state.shutdown, |v| acc.push(v))
            .await
            .inspect_err(|_| increment_errors("SumSquare"))?;

        tracing::debug!(count = acc.count(), "SumSquare folded request stream");
        Ok(Response::new(Message { value: acc.total() }))
    }

    async fn streamrange_square(
        &self,
        request: Request<Streaming<Message>>,
    ) -> Result<Response<Self::StreamrangeSquareStream>, Status> {
        const METHOD: &str = "StreamrangeSquare";
        self.admit(METHOD)?;
        tracing::info!(metadata = ?request.metadata(), "StreamrangeSquare invocation metadata");

        let mut inbound = request.into_inner();
        let (resp_tx, stream) = self.response_channel();
        let guard = self.track();
        let shutdown = self.state.shutdown.clone();

        let fut = async move {
            let _guard = guard;
            let mut squares = Vec::new();
            if let Err(status) =
                for_each_value(&mut inbound, &shutdown, |v| squares.push(square(v))).await
            {
                increment_errors(METHOD);
                tracing::debug!("Request stream ended with {status}");
                if let Err(e) = resp_tx.send(Err(status)).await {
                    tracing::debug!("Failed to forward request stream failure: {e}");
                }
                return;
            }
            report_stream(METHOD, emit_all(squares, resp_tx, shutdown).await);
        };
        tokio::spawn(fut.instrument(tracing::info_span!("streaming", method = METHOD)));

        let mut response = Response::new(stream);
        attach_echo_metadata(&mut response)?;
        Ok(response)
    }
}
