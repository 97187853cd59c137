//! Demo client: one call of each shape against a running server, printing
//! results and the metadata that came with them.

use clap::Parser;
use echo_rpc_client::{CallMetadata, Client, ClientSettings};
use echo_rpc_core::{options::Compression, proto::Message};
use std::path::PathBuf;
use tokio_stream::StreamExt;
use tonic::metadata::MetadataMap;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Exercise every echo call shape")]
struct Args {
    /// Target, or a comma-joined list of targets.
    #[arg(long, env = "ECHO_URL", default_value = "localhost:5000")]
    url: String,

    #[arg(long, env = "ECHO_TLS")]
    tls: bool,

    /// PEM CA bundle used to verify the server.
    #[arg(long, env = "ECHO_CA_CERT_PATH")]
    ca_cert_path: Option<PathBuf>,

    /// Name checked against the server certificate.
    #[arg(long, env = "ECHO_DOMAIN_NAME")]
    domain_name: Option<String>,

    #[arg(short = 'z', long, env = "ECHO_COMPRESSION", default_value = "none")]
    compression: Compression,

    /// How many values the streaming calls send or request.
    #[arg(short = 'n', long, default_value_t = 4)]
    count: u32,
}

fn print_metadata(label: &str, metadata: Option<MetadataMap>) {
    match metadata {
        Some(metadata) => println!("  {label}: {:?}", metadata.into_headers()),
        None => println!("  {label}: <none>"),
    }
}

fn values(count: u32) -> impl tokio_stream::Stream<Item = Message> {
    tokio_stream::iter((0..count).map(|i| Message {
        value: f64::from(i),
    }))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let settings = ClientSettings {
        tls: args.tls,
        ca_certificate: args.ca_cert_path,
        domain_name: args.domain_name,
        compression: args.compression,
        ..Default::default()
    };
    let mut client = Client::connect_lazy(&args.url, settings)?;
    let count = args.count;

    client
        .scope(async |client: &Client| -> anyhow::Result<()> {
            println!("Square");
            let response = client.square(Message { value: 2.0 }).await?;
            print_metadata("metadata", Some(response.metadata().clone()));
            println!("  {:?}", response.into_inner());

            println!("RangeSquare");
            let mut request = tonic::Request::new(Message {
                value: f64::from(count),
            });
            let metadata = CallMetadata::attach(&mut request);
            let mut stream = client.range_square(request).await?.into_inner();
            print_metadata("initial", metadata.initial_metadata().await);
            while let Some(message) = stream.next().await {
                println!("  {:?}", message?);
            }
            print_metadata("trailing", metadata.trailing_metadata().await);

            println!("SumSquare");
            let response = client.sum_square(values(count)).await?;
            println!("  {:?}", response.into_inner());

            println!("StreamrangeSquare");
            let mut request = tonic::Request::new(values(count));
            let metadata = CallMetadata::attach(&mut request);
            let mut stream = client.streamrange_square(request).await?.into_inner();
            print_metadata("initial", metadata.initial_metadata().await);
            while let Some(message) = stream.next().await {
                println!("  {:?}", message?);
            }
            print_metadata("trailing", metadata.trailing_metadata().await);
            Ok(())
        })
        .await
}
