//! Outbound channel construction.
//!
//! A target is a single `host:port` (or URI) or a comma-joined list of them.
//! Each target becomes one [`Endpoint`] tuned from the [`ChannelConfig`]; a
//! list is balanced across all of its endpoints.

use crate::client::error::{ClientError, Result};
use echo_rpc_core::options::{
    ChannelConfig, ChannelOptions, Compression, TransportSettings, split_targets,
};
use std::{path::PathBuf, time::Duration};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

/// Everything about a client connection except its target.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub tls: bool,
    /// PEM CA bundle; the platform roots are used when unset.
    pub ca_certificate: Option<PathBuf>,
    /// Overrides the name checked against the server certificate.
    pub domain_name: Option<String>,
    pub compression: Compression,
    pub transport: TransportSettings,
    /// Caller-supplied transport options, applied after `transport`.
    pub options: ChannelOptions,
    /// How long a replaced channel may keep serving its calls.
    pub replace_grace: Option<Duration>,
}

/// A lazily connecting channel and the configuration it was built from.
#[derive(Debug, Clone)]
pub struct Transport {
    pub channel: Channel,
    pub options: ChannelOptions,
    pub config: ChannelConfig,
    pub endpoints: usize,
}

impl Transport {
    /// Builds the channel for `target`. No connection is made until the
    /// first call.
    ///
    /// A list of targets is balanced by [`Channel::balance_list`], which
    /// picks between endpoints with power-of-two-choices on pending load.
    /// The recorded options and [`ChannelConfig::lb_policy`] still read
    /// `round_robin`; they describe the requested policy, not the balancer
    /// actually in use.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn connect_lazy(target: &str, settings: &ClientSettings) -> Result<Self> {
        let targets = split_targets(target);
        if targets.is_empty() {
            return Err(ClientError::InvalidUrl {
                url: target.to_owned(),
                reason: "no address given".to_owned(),
            });
        }

        let options = ChannelOptions::for_client(target, &settings.transport, &settings.options);
        let config = ChannelConfig::from(&options);
        let tls = tls_config(settings)?;

        let endpoints = targets
            .iter()
            .map(|target| endpoint(target, tls.as_ref(), &config))
            .collect::<Result<Vec<_>>>()?;
        let count = endpoints.len();

        let channel = match <[Endpoint; 1]>::try_from(endpoints) {
            Ok([single]) => single.connect_lazy(),
            Err(many) => Channel::balance_list(many.into_iter()),
        };

        Ok(Self {
            channel,
            options,
            config,
            endpoints: count,
        })
    }

    pub const fn is_balanced(&self) -> bool {
        self.endpoints > 1
    }
}

fn endpoint(target: &str, tls: Option<&ClientTlsConfig>, config: &ChannelConfig) -> Result<Endpoint> {
    let uri = if target.contains("://") {
        target.to_owned()
    } else {
        let scheme = if tls.is_some() { "https" } else { "http" };
        format!("{scheme}://{target}")
    };

    let mut endpoint = Endpoint::from_shared(uri).map_err(|e| ClientError::InvalidUrl {
        url: target.to_owned(),
        reason: e.to_string(),
    })?;

    if let Some(mode) = config.optimization_target {
        endpoint = endpoint
            .tcp_nodelay(mode.prefers_nodelay())
            .http2_adaptive_window(mode.prefers_adaptive_window());
    }
    if let Some(window) = config.initial_window_size {
        endpoint = endpoint.initial_stream_window_size(window);
    }
    if let Some(interval) = config.keepalive_time {
        endpoint = endpoint.http2_keep_alive_interval(interval);
    }
    if let Some(timeout) = config.keepalive_timeout {
        endpoint = endpoint.keep_alive_timeout(timeout);
    }
    endpoint = endpoint.keep_alive_while_idle(config.keepalive_permit_without_calls);

    if let Some(tls) = tls {
        endpoint = endpoint.tls_config(tls.clone())?;
    }
    Ok(endpoint)
}

fn tls_config(settings: &ClientSettings) -> Result<Option<ClientTlsConfig>> {
    if !settings.tls {
        return Ok(None);
    }

    let mut tls = match &settings.ca_certificate {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|source| ClientError::Credentials {
                path: path.clone(),
                source,
            })?;
            ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem))
        }
        None => ClientTlsConfig::new().with_native_roots(),
    };
    if let Some(domain) = &settings.domain_name {
        tls = tls.domain_name(domain.clone());
    }
    Ok(Some(tls))
}
