//! Server bootstrap: one listener, one `tonic` server.
//!
//! [`Bootstrap`] turns a [`ServerConfig`] into a running server:
//!
//! 1. Build the transport option list for the listener role and snapshot it
//!    into a [`ChannelConfig`].
//! 2. Load TLS credentials if both paths are set. Any read or parse failure
//!    is logged and the server falls back to plaintext.
//! 3. Stack the layers (outermost first): call timing, the server-wide
//!    concurrency cap, trailing metadata.
//! 4. Register health, reflection (v1 and v1alpha) and the echo service.
//! 5. Mark every registered service and the overall server `SERVING`.
//! 6. Serve until the shutdown signal, then mark `NOT_SERVING` and drain.

use crate::server::{
    config::ServerConfig,
    limit::CallLimitLayer,
    service::handler::EchoService,
    telemetry::TelemetryObserver,
    trailers::TrailersLayer,
};
use anyhow::Context;
use echo_rpc_core::{
    options::{ChannelConfig, ChannelOptions, Compression, ListenerRole},
    proto::{FILE_DESCRIPTOR_SET, echo_server::EchoServer},
    timing::{CallObserver, Side, TimingLayer},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{net::SocketAddr, path::Path, sync::Arc};
use tokio::{net::TcpListener, signal};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{
    codec::CompressionEncoding,
    server::NamedService,
    transport::{Identity, Server, ServerTlsConfig},
};
use tonic_health::ServingStatus;
use tower::ServiceBuilder;

/// Pending connections queued by the kernel per listener.
pub const LISTEN_BACKLOG: i32 = 1024;

pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";
pub const REFLECTION_V1_SERVICE: &str = "grpc.reflection.v1.ServerReflection";
pub const REFLECTION_V1ALPHA_SERVICE: &str = "grpc.reflection.v1alpha.ServerReflection";

/// Every name reported by the health service, including the empty
/// overall-server name.
pub fn health_service_names() -> [&'static str; 5] {
    [
        <EchoServer<EchoService> as NamedService>::NAME,
        HEALTH_SERVICE,
        REFLECTION_V1_SERVICE,
        REFLECTION_V1ALPHA_SERVICE,
        "",
    ]
}

/// A configured, not yet running server.
pub struct Bootstrap {
    config: Arc<ServerConfig>,
    role: ListenerRole,
    service: EchoService,
    observer: Arc<dyn CallObserver>,
}

impl Bootstrap {
    pub fn new(config: Arc<ServerConfig>, role: ListenerRole) -> Self {
        let service = EchoService::new(config.stream_buffer_size);
        Self {
            config,
            role,
            service,
            observer: Arc::new(TelemetryObserver),
        }
    }

    /// Replaces the sink that receives call timings.
    pub fn with_observer(mut self, observer: impl CallObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn service(&self) -> &EchoService {
        &self.service
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions::for_server(&self.config.transport, self.role)
    }

    /// Binds the configured address. Pooled workers bind with
    /// `SO_REUSEPORT` so they can share the port.
    pub fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.socket_addr()?;
        let std_listener = bind_listener(addr, self.role == ListenerRole::PooledWorker)?;
        TcpListener::from_std(std_listener).context("failed to register listener with runtime")
    }

    /// Binds the configured address and serves until `signal` resolves.
    pub async fn run<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind()?;
        self.serve_with_shutdown(listener, signal).await
    }

    /// Serves on `listener` until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let options = self.channel_options();
        let channel = ChannelConfig::from(&options);
        let addr = listener.local_addr()?;

        let (server, tls) = secure_or_insecure(&self.config);
        let server = tune(server, &channel);

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        let reflection_v1 = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
            .build_v1()?;
        let reflection_v1alpha = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        if self.config.use_channelz {
            tracing::warn!("channelz is not provided by this transport; `use_channelz` ignored");
        }

        log_startup_info(addr, tls, &options, &channel, &self.config);

        for name in health_service_names() {
            health_reporter
                .set_service_status(name, ServingStatus::Serving)
                .await;
        }

        let service = self.service.clone();
        let drain_timeout = self.config.shutdown_timeout();
        let shutdown = async move {
            signal.await;
            tracing::info!("Shutdown signal received, terminating gracefully...");

            // 1. Publish the status
            for name in health_service_names() {
                health_reporter
                    .set_service_status(name, ServingStatus::NotServing)
                    .await;
            }

            // 2. Perform graceful shutdown
            service.shutdown(drain_timeout).await;
        };

        let layers = ServiceBuilder::new()
            .layer(TimingLayer::from_arc(Side::Server, Arc::clone(&self.observer)))
            .layer(CallLimitLayer::new(self.config.maximum_concurrent_rpcs))
            .layer(TrailersLayer);

        server
            .layer(layers)
            .add_service(health_service)
            .add_service(reflection_v1)
            .add_service(reflection_v1alpha)
            .add_service(build_echo_service(
                self.service,
                &channel,
                self.config.compression,
            ))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        tracing::info!(pid = std::process::id(), "Service shut down successfully");
        Ok(())
    }
}

/// Creates a non-blocking listening socket for `addr`.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        set_reuse_port(&socket)?;
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

#[cfg(unix)]
pub(crate) fn set_reuse_port(socket: &Socket) -> anyhow::Result<()> {
    socket
        .set_reuse_port(true)
        .context("failed to set SO_REUSEPORT")?;
    if !socket.reuse_port()? {
        anyhow::bail!("SO_REUSEPORT did not stick");
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_reuse_port(_socket: &Socket) -> anyhow::Result<()> {
    anyhow::bail!("SO_REUSEPORT is not supported on this platform")
}

fn load_identity(cert: &Path, key: &Path) -> anyhow::Result<Identity> {
    let cert = std::fs::read(cert).with_context(|| format!("cannot read {}", cert.display()))?;
    let key = std::fs::read(key).with_context(|| format!("cannot read {}", key.display()))?;
    Ok(Identity::from_pem(cert, key))
}

/// Returns a TLS server if both credential paths are set and usable, a
/// plaintext server otherwise. The flag reports which one was built.
fn secure_or_insecure(config: &ServerConfig) -> (Server, bool) {
    let (Some(cert), Some(key)) = (&config.server_cert_path, &config.server_key_path) else {
        return (Server::builder(), false);
    };

    let secure = load_identity(cert, key).and_then(|identity| {
        Server::builder()
            .tls_config(ServerTlsConfig::new().identity(identity))
            .context("invalid TLS credentials")
    });

    match secure {
        Ok(server) => (server, true),
        Err(e) => {
            tracing::warn!("tls load error: {e:#}; serving without TLS");
            (Server::builder(), false)
        }
    }
}

/// Applies the transport knobs `tonic` exposes.
fn tune(server: Server, channel: &ChannelConfig) -> Server {
    let mut server = server
        .max_concurrent_streams(channel.max_concurrent_streams)
        .initial_stream_window_size(channel.initial_window_size)
        .http2_keepalive_interval(channel.keepalive_time)
        .http2_keepalive_timeout(channel.keepalive_timeout);

    if let Some(mode) = channel.optimization_target {
        server = server
            .tcp_nodelay(mode.prefers_nodelay())
            .http2_adaptive_window(Some(mode.prefers_adaptive_window()));
    }

    server
}

fn build_echo_service(
    service: EchoService,
    channel: &ChannelConfig,
    compression: Compression,
) -> EchoServer<EchoService> {
    let mut server = EchoServer::new(service);
    if let Some(limit) = channel.max_receive_message_length {
        server = server.max_decoding_message_size(limit);
    }
    if let Some(limit) = channel.max_send_message_length {
        server = server.max_encoding_message_size(limit);
    }
    if let Some(encoding) = Option::<CompressionEncoding>::from(compression) {
        server = server.send_compressed(encoding);
    }
    for encoding in Compression::ACCEPTED {
        server = server.accept_compressed(encoding);
    }
    server
}

fn log_startup_info(
    addr: SocketAddr,
    tls: bool,
    options: &ChannelOptions,
    channel: &ChannelConfig,
    config: &ServerConfig,
) {
    let pid = std::process::id();
    tracing::info!(
        pid,
        tls,
        max_concurrent_rpcs = config.maximum_concurrent_rpcs,
        compression = %config.compression,
        "grpc worker start @{addr}"
    );

    if cfg!(debug_assertions) {
        let rendered: Vec<String> = options.iter().map(|(k, v)| format!("{k}={v}")).collect();
        tracing::debug!("Transport options: {}", rendered.join(", "));
    }

    // No direct `tonic` knob; carried in the option list only.
    let unapplied = [
        ("grpc.max_connection_idle_ms", channel.max_connection_idle.is_some()),
        ("grpc.max_connection_age_ms", channel.max_connection_age.is_some()),
        (
            "grpc.max_connection_age_grace_ms",
            channel.max_connection_age_grace.is_some(),
        ),
        (
            "grpc.keepalive_permit_without_calls",
            channel.keepalive_permit_without_calls,
        ),
    ];
    for (key, set) in unapplied {
        if set {
            tracing::debug!("{key} is recorded but not enforced by the transport");
        }
    }
    for (key, value) in &channel.extra {
        tracing::debug!("Extra transport option {key}={value} is recorded only");
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
