//! The [`Client`] connection facade.
//!
//! A `Client` owns at most one channel at a time. Every call goes through the
//! same stack (outermost first): call timing, metadata capture, the channel.
//! Closing a client ends its calls; a closed client can be pointed at a new
//! target with [`Client::initialize_from_url`].

use crate::client::{
    capture::CaptureLayer,
    error::{ClientError, Result},
    transport::{ClientSettings, Transport},
};
use echo_rpc_core::{
    options::{ChannelConfig, ChannelOptions, Compression},
    proto::{Message, echo_client::EchoClient},
    timing::{CallObserver, LogObserver, Side, Timing, TimingLayer},
};
use std::{sync::Arc, time::Duration};
use tonic::{
    IntoRequest, IntoStreamingRequest, Response, Streaming, codec::CompressionEncoding,
    transport::Channel,
};
use tower::ServiceBuilder;

/// How often a closing client checks whether its calls have finished.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Channel type behind every stub.
pub type EchoChannel = Timing<crate::client::capture::Capture<Channel>>;
/// Generated stub over [`EchoChannel`].
pub type EchoStub = EchoClient<EchoChannel>;

struct Connection {
    url: String,
    stub: EchoStub,
    capture: CaptureLayer,
    transport: Transport,
}

impl Connection {
    fn open(url: &str, settings: &ClientSettings, observer: &Arc<dyn CallObserver>) -> Result<Self> {
        let transport = Transport::connect_lazy(url, settings)?;
        let capture = CaptureLayer::new();
        let service = ServiceBuilder::new()
            .layer(TimingLayer::from_arc(Side::Client, Arc::clone(observer)))
            .layer(capture.clone())
            .service(transport.channel.clone());

        let stub = configure_stub(EchoClient::new(service), &transport.config, settings.compression);
        tracing::debug!(url, balanced = transport.is_balanced(), "Opened channel");

        Ok(Self {
            url: url.to_owned(),
            stub,
            capture,
            transport,
        })
    }

    /// Waits up to `grace` for calls to finish, then cancels the rest.
    async fn close(self, grace: Option<Duration>) {
        if let Some(grace) = grace {
            let drained = tokio::time::timeout(grace, async {
                while self.capture.inflight() > 0 {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!(
                    url = %self.url,
                    inflight = self.capture.inflight(),
                    "Grace period elapsed, cancelling calls"
                );
            }
        }
        self.capture.close();
        tracing::debug!(url = %self.url, "Closed channel");
    }
}

fn configure_stub(mut stub: EchoStub, config: &ChannelConfig, compression: Compression) -> EchoStub {
    if let Some(limit) = config.max_receive_message_length {
        stub = stub.max_decoding_message_size(limit);
    }
    if let Some(limit) = config.max_send_message_length {
        stub = stub.max_encoding_message_size(limit);
    }
    if let Some(encoding) = Option::<CompressionEncoding>::from(compression) {
        stub = stub.send_compressed(encoding);
    }
    for encoding in Compression::ACCEPTED {
        stub = stub.accept_compressed(encoding);
    }
    stub
}

/// Client for the `echo.Echo` service.
///
/// Construct one with [`Client::with_url`], or defer with [`Client::new`]
/// and call [`Client::initialize_from_url`] later. Channels connect lazily,
/// on the first call.
pub struct Client {
    url: Option<String>,
    settings: ClientSettings,
    observer: Arc<dyn CallObserver>,
    connection: Option<Connection>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Client {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.url)
            .field("settings", &self.settings)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// A client with no target yet.
    pub fn new() -> Self {
        Self::with_settings(ClientSettings::default())
    }

    pub fn with_settings(settings: ClientSettings) -> Self {
        Self {
            url: None,
            settings,
            observer: Arc::new(LogObserver),
            connection: None,
        }
    }

    /// Builds a client and its channel for `url`.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn with_url(url: impl Into<String>) -> Result<Self> {
        Self::connect_lazy(url, ClientSettings::default())
    }

    /// Like [`Client::with_url`] with explicit settings.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn connect_lazy(url: impl Into<String>, settings: ClientSettings) -> Result<Self> {
        let mut client = Self::with_settings(settings);
        client.initialize_from_url(url)?;
        Ok(client)
    }

    /// Replaces the sink receiving call timings. Applies to channels opened
    /// afterwards.
    pub fn with_observer(mut self, observer: impl CallObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Points the client at `url` and opens a new channel.
    ///
    /// A previous channel keeps serving its calls for
    /// [`ClientSettings::replace_grace`] and is then closed by a task spawned
    /// on the current runtime.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime, both when opening the new
    /// channel and when closing the previous one.
    pub fn initialize_from_url(&mut self, url: impl Into<String>) -> Result<&mut Self> {
        let url = url.into();
        let connection = Connection::open(&url, &self.settings, &self.observer)?;
        self.url = Some(url);

        if let Some(previous) = self.connection.replace(connection) {
            let grace = self.settings.replace_grace;
            tokio::spawn(previous.close(grace));
        }
        Ok(self)
    }

    /// Closes the channel. With a grace period, calls in flight may finish
    /// within it; whatever is left is cancelled.
    pub async fn close(&mut self, grace: Option<Duration>) {
        if let Some(connection) = self.connection.take() {
            connection.close(grace).await;
        }
    }

    /// Opens a channel for the configured URL if there is none.
    ///
    /// # Panics
    /// Panics if a channel has to be opened outside a Tokio runtime.
    pub fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let url = self.url.clone().ok_or(ClientError::NotInitialized)?;
        self.connection = Some(Connection::open(&url, &self.settings, &self.observer)?);
        Ok(())
    }

    /// Runs `body` with a connected client and closes the channel afterwards,
    /// whether `body` succeeded or not.
    pub async fn scope<T, E>(
        &mut self,
        body: impl AsyncFnOnce(&Client) -> core::result::Result<T, E>,
    ) -> core::result::Result<T, E>
    where
        E: From<ClientError>,
    {
        self.ensure_connected()?;
        let result = body(&*self).await;
        self.close(None).await;
        result
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Calls started on the current channel and not yet finished.
    pub fn inflight(&self) -> usize {
        self.connection
            .as_ref()
            .map_or(0, |connection| connection.capture.inflight())
    }

    pub fn channel_options(&self) -> Option<&ChannelOptions> {
        self.connection
            .as_ref()
            .map(|connection| &connection.transport.options)
    }

    pub fn channel_config(&self) -> Option<&ChannelConfig> {
        self.connection
            .as_ref()
            .map(|connection| &connection.transport.config)
    }

    /// A stub bound to the current channel.
    pub fn stub(&self) -> Result<EchoStub> {
        self.connection
            .as_ref()
            .map(|connection| connection.stub.clone())
            .ok_or(ClientError::NotInitialized)
    }

    pub async fn square(&self, request: impl IntoRequest<Message>) -> Result<Response<Message>> {
        Ok(self.stub()?.square(request).await?)
    }

    pub async fn range_square(
        &self,
        request: impl IntoRequest<Message>,
    ) -> Result<Response<Streaming<Message>>> {
        Ok(self.stub()?.range_square(request).await?)
    }

    pub async fn sum_square(
        &self,
        request: impl IntoStreamingRequest<Message = Message>,
    ) -> Result<Response<Message>> {
        Ok(self.stub()?.sum_square(request).await?)
    }

    pub async fn streamrange_square(
        &self,
        request: impl IntoStreamingRequest<Message = Message>,
    ) -> Result<Response<Streaming<Message>>> {
        Ok(self.stub()?.streamrange_square(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_rpc_core::options::{LbPolicy, TransportSettings, keys};

    #[tokio::test(flavor = "multi_thread")]
    async fn deferred_client_needs_a_url() {
        let mut client = Client::new();
        assert!(!client.is_connected());
        assert!(matches!(client.stub(), Err(ClientError::NotInitialized)));
        assert!(matches!(
            client.ensure_connected(),
            Err(ClientError::NotInitialized)
        ));

        let err = client.square(Message { value: 2.0 }).await.unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reinitializing_replaces_the_channel() {
        let mut client = Client::with_url("127.0.0.1:5000").unwrap();
        assert_eq!(client.url(), Some("127.0.0.1:5000"));
        assert_eq!(client.channel_config().unwrap().lb_policy, LbPolicy::PickFirst);

        client
            .initialize_from_url("127.0.0.1:5000,127.0.0.1:5001")
            .unwrap();
        assert_eq!(client.url(), Some("127.0.0.1:5000,127.0.0.1:5001"));
        assert_eq!(client.channel_config().unwrap().lb_policy, LbPolicy::RoundRobin);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn settings_shape_the_channel_options() {
        let settings = ClientSettings {
            compression: Compression::Gzip,
            transport: TransportSettings {
                max_rec_msg_size: Some(2048),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut client = Client::with_settings(settings);
        assert_eq!(client.settings().compression, Compression::Gzip);
        assert!(client.channel_options().is_none());

        client.initialize_from_url("127.0.0.1:5000").unwrap();
        let options = client.channel_options().unwrap();
        assert_eq!(options.get_int(keys::MAX_RECEIVE_MESSAGE_LENGTH), Some(2048));
        assert_eq!(
            client.channel_config().unwrap().max_receive_message_length,
            Some(2048)
        );

        client.close(None).await;
        assert!(client.channel_options().is_none());
        assert_eq!(client.settings().transport.max_rec_msg_size, Some(2048));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scope_closes_after_failure() {
        let mut client = Client::with_url("127.0.0.1:5000").unwrap();
        let result: core::result::Result<(), ClientError> = client
            .scope(async |_client: &Client| Err(ClientError::NotInitialized))
            .await;
        assert!(result.is_err());
        assert!(!client.is_connected());

        // The URL is kept, so the next scope reconnects.
        let result: core::result::Result<bool, ClientError> = client
            .scope(async |client: &Client| Ok(client.is_connected()))
            .await;
        assert!(result.unwrap());
        assert!(!client.is_connected());
    }
}
