use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use echo_rpc_core::options::{Compression, GrpcMode, TransportSettings};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, net::ToSocketAddrs, path::PathBuf};

/// Receive/send message size used when the configuration names none.
pub const DEFAULT_MAX_MSG_SIZE: u64 = 1024 * 1024;

/// Per-connection stream cap used when the configuration names none.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u64 = 100;

/// Runtime configuration for the `echo-rpc-server` binary.
///
/// Every key may come from a JSON file (`--config-json`), an environment
/// variable or a flag. Flags and environment variables win over the file.
///
/// Pooled worker processes are started with the supervisor's own arguments
/// plus `--as-worker --address <resolved>`; later occurrences of a flag
/// override earlier ones.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "echo-rpc-server",
    version,
    about = "A gRPC echo service exercising all four call shapes",
    args_override_self = true
)]
pub struct CliArgs {
    /// Path to a JSON object holding any of the configuration keys below.
    ///
    /// Environment variable: `ECHO_CONFIG_JSON`
    #[arg(long, env = "ECHO_CONFIG_JSON")]
    pub config_json: Option<PathBuf>,

    /// Address to listen on, `host:port`. Defaults to `0.0.0.0:5000`.
    ///
    /// Environment variable: `ECHO_ADDRESS`
    #[arg(short, long, env = "ECHO_ADDRESS")]
    pub address: Option<String>,

    /// Number of server processes sharing the listen address. `1` serves from
    /// this process; zero or negative uses one process per CPU.
    ///
    /// Environment variable: `ECHO_WORKERS`
    #[arg(short, long, env = "ECHO_WORKERS", allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// Runtime worker threads per process.
    ///
    /// Environment variable: `ECHO_MAX_THREADS`
    #[arg(short = 't', long, env = "ECHO_MAX_THREADS")]
    pub max_threads: Option<usize>,

    /// Cap on concurrently executing calls per process. Defaults to 50.
    ///
    /// Environment variable: `ECHO_MAXIMUM_CONCURRENT_RPCS`
    #[arg(short, long, env = "ECHO_MAXIMUM_CONCURRENT_RPCS")]
    pub maximum_concurrent_rpcs: Option<usize>,

    /// Request a channelz introspection service.
    ///
    /// Environment variable: `ECHO_USE_CHANNELZ`
    #[arg(long, env = "ECHO_USE_CHANNELZ", num_args = 0..=1, default_missing_value = "true")]
    pub use_channelz: Option<bool>,

    /// PEM certificate chain. TLS is enabled only if both the certificate
    /// and the key are given and readable.
    ///
    /// Environment variable: `ECHO_SERVER_CERT_PATH`
    #[arg(long, env = "ECHO_SERVER_CERT_PATH")]
    pub server_cert_path: Option<PathBuf>,

    /// PEM private key matching `--server-cert-path`.
    ///
    /// Environment variable: `ECHO_SERVER_KEY_PATH`
    #[arg(long, env = "ECHO_SERVER_KEY_PATH")]
    pub server_key_path: Option<PathBuf>,

    /// Transport tuning: `latency`, `blend` or `throughput`.
    ///
    /// Environment variable: `ECHO_GRPC_MODE`
    #[arg(long, env = "ECHO_GRPC_MODE")]
    pub grpc_mode: Option<GrpcMode>,

    /// Largest accepted message, in bytes.
    ///
    /// Environment variable: `ECHO_MAX_REC_MSG_SIZE`
    #[arg(long, env = "ECHO_MAX_REC_MSG_SIZE")]
    pub max_rec_msg_size: Option<u64>,

    /// Largest sent message, in bytes.
    ///
    /// Environment variable: `ECHO_MAX_SEND_MSG_SIZE`
    #[arg(long, env = "ECHO_MAX_SEND_MSG_SIZE")]
    pub max_send_msg_size: Option<u64>,

    /// Initial HTTP/2 stream window, in bytes.
    ///
    /// Environment variable: `ECHO_INITIAL_WINDOW_SIZE`
    #[arg(long, env = "ECHO_INITIAL_WINDOW_SIZE")]
    pub initial_window_size: Option<u64>,

    /// Concurrent streams allowed on one connection.
    ///
    /// Environment variable: `ECHO_MAX_CONCURRENT_STREAMS`
    #[arg(long, env = "ECHO_MAX_CONCURRENT_STREAMS")]
    pub max_concurrent_streams: Option<u64>,

    /// Seconds an idle connection is kept open.
    ///
    /// Environment variable: `ECHO_MAX_CONNECTION_IDLE`
    #[arg(long, env = "ECHO_MAX_CONNECTION_IDLE")]
    pub max_connection_idle: Option<u64>,

    /// Seconds after which a connection is asked to go away.
    ///
    /// Environment variable: `ECHO_MAX_CONNECTION_AGE`
    #[arg(long, env = "ECHO_MAX_CONNECTION_AGE")]
    pub max_connection_age: Option<u64>,

    /// Seconds in-flight calls get to finish once a connection aged out.
    ///
    /// Environment variable: `ECHO_MAX_CONNECTION_AGE_GRACE`
    #[arg(long, env = "ECHO_MAX_CONNECTION_AGE_GRACE")]
    pub max_connection_age_grace: Option<u64>,

    /// Seconds between keepalive pings on an idle connection.
    ///
    /// Environment variable: `ECHO_KEEPALIVE_TIME`
    #[arg(long, env = "ECHO_KEEPALIVE_TIME")]
    pub keepalive_time: Option<u64>,

    /// Seconds to wait for a keepalive ack before dropping the connection.
    ///
    /// Environment variable: `ECHO_KEEPALIVE_TIMEOUT`
    #[arg(long, env = "ECHO_KEEPALIVE_TIMEOUT")]
    pub keepalive_timeout: Option<u64>,

    /// Allow keepalive pings while no call is active.
    ///
    /// Environment variable: `ECHO_KEEPALIVE_PERMIT_WITHOUT_STREAM`
    #[arg(
        long,
        env = "ECHO_KEEPALIVE_PERMIT_WITHOUT_STREAM",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub keepalive_permit_without_stream: Option<bool>,

    /// Compression for sent messages: `none`, `deflate`, `gzip` or `zstd`.
    ///
    /// Environment variable: `ECHO_COMPRESSION`
    #[arg(short = 'z', long, env = "ECHO_COMPRESSION")]
    pub compression: Option<Compression>,

    /// Extra transport options as `key:value`. Repeatable.
    ///
    /// Environment variable: `ECHO_RPC_OPTIONS` (comma separated)
    #[arg(short = 'o', long = "rpc-option", env = "ECHO_RPC_OPTIONS", value_delimiter = ',')]
    pub rpc_options: Vec<String>,

    /// Capacity of the buffer between a stream producer and the response.
    ///
    /// Environment variable: `ECHO_STREAM_BUFFER_SIZE`
    #[arg(long, env = "ECHO_STREAM_BUFFER_SIZE")]
    pub stream_buffer_size: Option<usize>,

    /// Seconds to wait for in-flight streams on shutdown. Unbounded if unset.
    ///
    /// Environment variable: `ECHO_SHUTDOWN_TIMEOUT`
    #[arg(long, env = "ECHO_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: Option<u64>,

    /// Set on processes spawned by the process group.
    #[arg(long, hide = true)]
    pub as_worker: bool,
}

/// Validated configuration shared by the bootstrap, the process group and
/// the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub workers: Option<i64>,
    pub max_threads: Option<usize>,
    pub maximum_concurrent_rpcs: usize,
    pub use_channelz: bool,
    pub server_cert_path: Option<PathBuf>,
    pub server_key_path: Option<PathBuf>,
    pub compression: Compression,
    #[serde(flatten)]
    pub transport: TransportSettings,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Option<u64>,
    #[serde(skip)]
    pub as_worker: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:5000".to_owned(),
            workers: None,
            max_threads: None,
            maximum_concurrent_rpcs: 50,
            use_channelz: false,
            server_cert_path: None,
            server_key_path: None,
            compression: Compression::None,
            transport: TransportSettings::default(),
            stream_buffer_size: 8,
            shutdown_timeout: None,
            as_worker: false,
        }
    }
}

impl ServerConfig {
    /// Parses a JSON configuration object. Unknown keys are ignored.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("invalid configuration JSON")
    }

    /// Resolves [`Self::address`] to the first socket address it names.
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.address
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve address `{}`", self.address))?
            .next()
            .with_context(|| format!("address `{}` resolved to nothing", self.address))
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout.map(Duration::from_secs)
    }

    /// Layers CLI/env values over `self`. Only values that were given win.
    fn apply(&mut self, args: CliArgs) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = args.$field { self.$field = v; })*
            };
        }
        macro_rules! take_opt {
            ($($field:ident),* $(,)?) => {
                $(if args.$field.is_some() { self.$field = args.$field; })*
            };
        }
        macro_rules! take_transport {
            ($($field:ident),* $(,)?) => {
                $(if args.$field.is_some() { self.transport.$field = args.$field; })*
            };
        }

        take!(
            address,
            maximum_concurrent_rpcs,
            use_channelz,
            compression,
            stream_buffer_size
        );
        take_opt!(
            workers,
            max_threads,
            server_cert_path,
            server_key_path,
            shutdown_timeout
        );
        take_transport!(
            grpc_mode,
            max_rec_msg_size,
            max_send_msg_size,
            initial_window_size,
            max_concurrent_streams,
            max_connection_idle,
            max_connection_age,
            max_connection_age_grace,
            keepalive_time,
            keepalive_timeout,
            keepalive_permit_without_stream,
        );
        self.transport.rpc_options.extend(args.rpc_options);
        self.as_worker = args.as_worker;
    }

    fn validate(self) -> anyhow::Result<Self> {
        if self.maximum_concurrent_rpcs == 0 {
            bail!("maximum_concurrent_rpcs must be greater than 0");
        }
        if self.stream_buffer_size == 0 {
            bail!("stream_buffer_size must be greater than 0");
        }
        if self.max_threads == Some(0) {
            bail!("max_threads must be greater than 0");
        }
        self.socket_addr()?;
        Ok(self)
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let mut config = match &args.config_json {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        config.apply(args);

        let transport = &mut config.transport;
        transport.max_rec_msg_size.get_or_insert(DEFAULT_MAX_MSG_SIZE);
        transport.max_send_msg_size.get_or_insert(DEFAULT_MAX_MSG_SIZE);
        transport
            .max_concurrent_streams
            .get_or_insert(DEFAULT_MAX_CONCURRENT_STREAMS);

        config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("echo-rpc-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_fill_transport_limits() {
        let config = ServerConfig::try_from(parse(&["--address", "127.0.0.1:0"])).unwrap();
        assert_eq!(config.maximum_concurrent_rpcs, 50);
        assert_eq!(config.transport.max_rec_msg_size, Some(DEFAULT_MAX_MSG_SIZE));
        assert_eq!(config.transport.max_send_msg_size, Some(DEFAULT_MAX_MSG_SIZE));
        assert_eq!(
            config.transport.max_concurrent_streams,
            Some(DEFAULT_MAX_CONCURRENT_STREAMS)
        );
        assert_eq!(config.workers, None);
        assert!(!config.as_worker);
    }

    #[test]
    fn json_keys_map_onto_config() {
        let config = ServerConfig::from_json(
            r#"{
                "address": "127.0.0.1:6000",
                "workers": 0,
                "grpc_mode": "throughput",
                "max_rec_msg_size": 2048,
                "keepalive_enforement_permit_without_stream": true,
                "compression": "gzip",
                "rpc_options": ["grpc.foo:7", "bad-pair"],
                "log_level": "DEBUG"
            }"#,
        )
        .unwrap();

        assert_eq!(config.address, "127.0.0.1:6000");
        assert_eq!(config.workers, Some(0));
        assert_eq!(config.transport.grpc_mode, Some(GrpcMode::Throughput));
        assert_eq!(config.transport.max_rec_msg_size, Some(2048));
        assert_eq!(config.transport.keepalive_permit_without_stream, Some(true));
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.transport.rpc_options.len(), 2);
        assert_eq!(config.maximum_concurrent_rpcs, 50);
    }

    #[test]
    fn later_flags_override_earlier_ones() {
        let args = parse(&[
            "--address",
            "0.0.0.0:5000",
            "--workers",
            "4",
            "--as-worker",
            "--address",
            "127.0.0.1:5001",
        ]);
        assert_eq!(args.address.as_deref(), Some("127.0.0.1:5001"));
        let config = ServerConfig::try_from(args).unwrap();
        assert!(config.as_worker);
        assert_eq!(config.workers, Some(4));
    }

    #[test]
    fn negative_workers_parse() {
        let args = parse(&["--workers", "-1", "--address", "127.0.0.1:0"]);
        assert_eq!(args.workers, Some(-1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ServerConfig::try_from(parse(&["--address", "not an address"])).is_err());
        assert!(
            ServerConfig::try_from(parse(&[
                "--address",
                "127.0.0.1:0",
                "--maximum-concurrent-rpcs",
                "0"
            ]))
            .is_err()
        );
        assert!(CliArgs::try_parse_from(["echo-rpc-server", "--grpc-mode", "fast"]).is_err());
    }

    #[test]
    fn bool_flags_accept_bare_form() {
        let args = parse(&["--use-channelz", "--keepalive-permit-without-stream", "false"]);
        assert_eq!(args.use_channelz, Some(true));
        assert_eq!(args.keepalive_permit_without_stream, Some(false));
    }
}
