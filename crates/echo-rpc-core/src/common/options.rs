//! # Channel configuration builder
//!
//! Turns the flat configuration map shared by the server and the client into
//! an ordered list of transport options, and reads that list back into a
//! typed, immutable [`ChannelConfig`].
//!
//! The option list keeps the well-known gRPC option names so that free-form
//! `rpc_options` entries (`key:value`) can override any of them. Setting a key
//! that is already present replaces its value in place; the position of the
//! first occurrence is kept.
//!
//! ## Build order
//!
//! 1. `grpc.so_reuseport` (server only, from the [`ListenerRole`])
//! 2. `grpc.optimization_target`
//! 3. `grpc.max_receive_message_length` / `grpc.max_send_message_length`
//! 4. `grpc.http2.lookahead_bytes`, `grpc.max_concurrent_streams`
//! 5. connection idle / age / age-grace (seconds to milliseconds)
//! 6. keepalive time / timeout / permit-without-calls
//! 7. `rpc_options`
//! 8. client only: more than one target forces `round_robin`

use crate::common::error::Error;
use core::{fmt, str::FromStr, time::Duration};
use serde::{Deserialize, Serialize};
use tonic::codec::CompressionEncoding;

/// Well-known option keys.
pub mod keys {
    pub const SO_REUSEPORT: &str = "grpc.so_reuseport";
    pub const OPTIMIZATION_TARGET: &str = "grpc.optimization_target";
    pub const MAX_RECEIVE_MESSAGE_LENGTH: &str = "grpc.max_receive_message_length";
    pub const MAX_SEND_MESSAGE_LENGTH: &str = "grpc.max_send_message_length";
    pub const LOOKAHEAD_BYTES: &str = "grpc.http2.lookahead_bytes";
    pub const MAX_CONCURRENT_STREAMS: &str = "grpc.max_concurrent_streams";
    pub const MAX_CONNECTION_IDLE_MS: &str = "grpc.max_connection_idle_ms";
    pub const MAX_CONNECTION_AGE_MS: &str = "grpc.max_connection_age_ms";
    pub const MAX_CONNECTION_AGE_GRACE_MS: &str = "grpc.max_connection_age_grace_ms";
    pub const KEEPALIVE_TIME_MS: &str = "grpc.keepalive_time_ms";
    pub const KEEPALIVE_TIMEOUT_MS: &str = "grpc.keepalive_timeout_ms";
    pub const KEEPALIVE_PERMIT_WITHOUT_CALLS: &str = "grpc.keepalive_permit_without_calls";
    pub const LB_POLICY_NAME: &str = "grpc.lb_policy_name";
}

/// A transport option value. `rpc_options` values made only of ASCII digits
/// become integers; everything else stays a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Str(String),
}

impl OptionValue {
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Str(v) => Some(v),
        }
    }

    fn coerce(raw: &str) -> Self {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(v) = raw.parse() {
                return Self::Int(v);
            }
        }
        Self::Str(raw.to_owned())
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Parses one `key:value` entry. Anything that does not split into exactly
/// two parts on `:` is rejected.
pub fn parse_option_pair(raw: &str) -> Option<(String, OptionValue)> {
    let mut parts = raw.split(':');
    let key = parts.next()?;
    let value = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((key.to_owned(), OptionValue::coerce(value)))
}

/// `grpc_mode`: what the transport should be tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrpcMode {
    Latency,
    Blend,
    Throughput,
}

impl GrpcMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::Blend => "blend",
            Self::Throughput => "throughput",
        }
    }

    /// Whether small writes should go out immediately (`TCP_NODELAY`).
    pub const fn prefers_nodelay(self) -> bool {
        matches!(self, Self::Latency | Self::Blend)
    }

    /// Whether HTTP/2 flow-control windows should adapt to the link.
    pub const fn prefers_adaptive_window(self) -> bool {
        matches!(self, Self::Throughput | Self::Blend)
    }
}

impl fmt::Display for GrpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrpcMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latency" => Ok(Self::Latency),
            "blend" => Ok(Self::Blend),
            "throughput" => Ok(Self::Throughput),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown grpc_mode `{other}` (expected latency|blend|throughput)"),
            }),
        }
    }
}

/// Message compression applied to sent messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Deflate,
    Gzip,
    Zstd,
}

impl Compression {
    /// Every encoding a peer may send us.
    pub const ACCEPTED: [CompressionEncoding; 3] = [
        CompressionEncoding::Zstd,
        CompressionEncoding::Gzip,
        CompressionEncoding::Deflate,
    ];
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Deflate => write!(f, "deflate"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "deflate" => Ok(Self::Deflate),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown compression `{other}` (expected none|deflate|gzip|zstd)"),
            }),
        }
    }
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Deflate => Some(CompressionEncoding::Deflate),
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

/// Load-balancing policy across the targets of one client channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LbPolicy {
    #[default]
    PickFirst,
    RoundRobin,
    Other(String),
}

impl LbPolicy {
    pub const ROUND_ROBIN: &'static str = "round_robin";
    pub const PICK_FIRST: &'static str = "pick_first";

    fn parse(raw: &str) -> Self {
        match raw {
            Self::ROUND_ROBIN => Self::RoundRobin,
            Self::PICK_FIRST => Self::PickFirst,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Whether the listener is a standalone server or one of several processes
/// sharing a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerRole {
    #[default]
    Standalone,
    PooledWorker,
}

/// The transport-related subset of the configuration map. Field names follow
/// the configuration keys; durations are in seconds, sizes in bytes.
///
/// A value of zero is treated the same as an absent key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub grpc_mode: Option<GrpcMode>,
    pub max_rec_msg_size: Option<u64>,
    pub max_send_msg_size: Option<u64>,
    pub initial_window_size: Option<u64>,
    pub max_concurrent_streams: Option<u64>,
    pub max_connection_idle: Option<u64>,
    pub max_connection_age: Option<u64>,
    pub max_connection_age_grace: Option<u64>,
    pub keepalive_time: Option<u64>,
    pub keepalive_timeout: Option<u64>,
    #[serde(rename = "keepalive_enforement_permit_without_stream")]
    pub keepalive_permit_without_stream: Option<bool>,
    pub rpc_options: Vec<String>,
}

/// Ordered transport option list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    entries: Vec<(String, OptionValue)>,
}

impl ChannelOptions {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Builds the server-side option list for `settings`.
    pub fn for_server(settings: &TransportSettings, role: ListenerRole) -> Self {
        let mut options = Self::new();
        let reuse = match role {
            ListenerRole::Standalone => 0,
            ListenerRole::PooledWorker => 1,
        };
        options.set(keys::SO_REUSEPORT, reuse);
        options.apply_settings(settings);
        options
    }

    /// Builds the client-side option list for `target`, starting from the
    /// caller's `extra` options.
    ///
    /// A target naming more than one comma-separated address always balances
    /// round-robin, whatever the caller asked for.
    pub fn for_client(target: &str, settings: &TransportSettings, extra: &ChannelOptions) -> Self {
        let mut options = Self::new();
        options.apply_settings(settings);
        options.extend(extra.iter().map(|(k, v)| (k.to_owned(), v.clone())));
        if split_targets(target).len() > 1 {
            options.set(keys::LB_POLICY_NAME, LbPolicy::ROUND_ROBIN);
        }
        options
    }

    fn apply_settings(&mut self, settings: &TransportSettings) {
        if let Some(mode) = settings.grpc_mode {
            self.set(keys::OPTIMIZATION_TARGET, mode.as_str());
        }

        self.set_positive(keys::MAX_RECEIVE_MESSAGE_LENGTH, settings.max_rec_msg_size, 1);
        self.set_positive(keys::MAX_SEND_MESSAGE_LENGTH, settings.max_send_msg_size, 1);
        self.set_positive(keys::LOOKAHEAD_BYTES, settings.initial_window_size, 1);
        self.set_positive(keys::MAX_CONCURRENT_STREAMS, settings.max_concurrent_streams, 1);

        self.set_positive(keys::MAX_CONNECTION_IDLE_MS, settings.max_connection_idle, 1000);
        self.set_positive(keys::MAX_CONNECTION_AGE_MS, settings.max_connection_age, 1000);
        self.set_positive(
            keys::MAX_CONNECTION_AGE_GRACE_MS,
            settings.max_connection_age_grace,
            1000,
        );
        self.set_positive(keys::KEEPALIVE_TIME_MS, settings.keepalive_time, 1000);
        self.set_positive(keys::KEEPALIVE_TIMEOUT_MS, settings.keepalive_timeout, 1000);
        if let Some(permit) = settings.keepalive_permit_without_stream {
            self.set(keys::KEEPALIVE_PERMIT_WITHOUT_CALLS, i64::from(permit));
        }

        self.extend_from_pairs(&settings.rpc_options);
    }

    fn set_positive(&mut self, key: &str, value: Option<u64>, scale: u64) {
        let Some(value) = value.filter(|v| *v > 0) else {
            return;
        };
        let scaled = i64::try_from(value.saturating_mul(scale)).unwrap_or(i64::MAX);
        self.set(key, scaled);
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Applies `key:value` entries, silently skipping malformed ones.
    pub fn extend_from_pairs<I, S>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for raw in pairs {
            if let Some((key, value)) = parse_option_pair(raw.as_ref()) {
                self.set(key, value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_int)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(OptionValue::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Extend<(String, OptionValue)> for ChannelOptions {
    fn extend<T: IntoIterator<Item = (String, OptionValue)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.set(key, value);
        }
    }
}

impl<K: Into<String>, V: Into<OptionValue>> FromIterator<(K, V)> for ChannelOptions {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut options = Self::new();
        for (key, value) in iter {
            options.set(key, value);
        }
        options
    }
}

/// Splits a comma-joined target list, ignoring blank entries.
pub fn split_targets(target: &str) -> Vec<&str> {
    target
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Typed snapshot of a [`ChannelOptions`] list.
///
/// Built once per server or channel and never mutated; reconfiguring means
/// building a new server or channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub reuse_port: bool,
    pub optimization_target: Option<GrpcMode>,
    pub max_receive_message_length: Option<usize>,
    pub max_send_message_length: Option<usize>,
    pub initial_window_size: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub max_connection_idle: Option<Duration>,
    pub max_connection_age: Option<Duration>,
    pub max_connection_age_grace: Option<Duration>,
    pub keepalive_time: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,
    pub keepalive_permit_without_calls: bool,
    pub lb_policy: LbPolicy,
    /// Options the transport has no direct knob for, kept for logging.
    pub extra: Vec<(String, OptionValue)>,
}

impl From<&ChannelOptions> for ChannelConfig {
    fn from(options: &ChannelOptions) -> Self {
        let mut config = Self::default();

        for (key, value) in options.iter() {
            let int = value.as_int();
            let millis = int.and_then(|v| u64::try_from(v).ok()).map(Duration::from_millis);
            match key {
                keys::SO_REUSEPORT => config.reuse_port = int.unwrap_or(0) != 0,
                keys::OPTIMIZATION_TARGET => {
                    config.optimization_target = value.as_str().and_then(|s| s.parse().ok());
                }
                keys::MAX_RECEIVE_MESSAGE_LENGTH => {
                    config.max_receive_message_length = int.and_then(|v| usize::try_from(v).ok());
                }
                keys::MAX_SEND_MESSAGE_LENGTH => {
                    config.max_send_message_length = int.and_then(|v| usize::try_from(v).ok());
                }
                keys::LOOKAHEAD_BYTES => {
                    config.initial_window_size = int.and_then(|v| u32::try_from(v).ok());
                }
                keys::MAX_CONCURRENT_STREAMS => {
                    config.max_concurrent_streams = int.and_then(|v| u32::try_from(v).ok());
                }
                keys::MAX_CONNECTION_IDLE_MS => config.max_connection_idle = millis,
                keys::MAX_CONNECTION_AGE_MS => config.max_connection_age = millis,
                keys::MAX_CONNECTION_AGE_GRACE_MS => config.max_connection_age_grace = millis,
                keys::KEEPALIVE_TIME_MS => config.keepalive_time = millis,
                keys::KEEPALIVE_TIMEOUT_MS => config.keepalive_timeout = millis,
                keys::KEEPALIVE_PERMIT_WITHOUT_CALLS => {
                    config.keepalive_permit_without_calls = int.unwrap_or(0) != 0;
                }
                keys::LB_POLICY_NAME => {
                    config.lb_policy = LbPolicy::parse(&value.to_string());
                }
                _ => config.extra.push((key.to_owned(), value.clone())),
            }
        }

        config
    }
}
