use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use echo_rpc_client::{Client, ClientSettings};
use echo_rpc_core::{
    options::{Compression, ListenerRole},
    proto::Message,
    timing::CallRecord,
};
use echo_rpc_server::server::{bootstrap::Bootstrap, config::ServerConfig};
use futures::stream::FuturesUnordered;
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;
use tokio_stream::StreamExt;

#[derive(Clone, Copy, Debug)]
struct EchoBenchParams {
    units: u32,
    concurrency: usize,
    compression: Compression,
}

fn echo_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    let addr = rt.block_on(async {
        let config = ServerConfig {
            address: "127.0.0.1:0".to_string(),
            maximum_concurrent_rpcs: 1024,
            ..ServerConfig::default()
        };
        let bootstrap = Bootstrap::new(Arc::new(config), ListenerRole::Standalone)
            .with_observer(|_record: CallRecord| {});
        let listener = bootstrap.bind().expect("Failed to bind server");
        let addr = listener.local_addr().expect("missing local addr");
        tokio::spawn(bootstrap.serve_with_shutdown(listener, std::future::pending()));
        addr
    });

    let units_cases = [1, 100, 10_000];
    let concurrency_cases = [1, 8, 32];
    let compression_cases = [Compression::None, Compression::Zstd, Compression::Gzip];

    let mut cases = Vec::new();
    for &units in &units_cases {
        for &concurrency in &concurrency_cases {
            for &compression in &compression_cases {
                cases.push(EchoBenchParams {
                    units,
                    concurrency,
                    compression,
                });
            }
        }
    }

    for params in &cases {
        let mut group = c.benchmark_group("grpc/echo");
        group.throughput(Throughput::Elements(
            u64::from(params.units) * params.concurrency as u64,
        ));

        for shape in ["range_square", "sum_square", "streamrange_square"] {
            group.bench_function(
                format!(
                    "{shape}/units/{}/conc/{}/comp/{}",
                    params.units, params.concurrency, params.compression,
                ),
                |b| {
                    b.to_async(&rt).iter_custom(|iters| async move {
                        let settings = ClientSettings {
                            compression: params.compression,
                            ..Default::default()
                        };
                        let client = Arc::new(
                            Client::connect_lazy(addr.to_string(), settings)
                                .expect("Failed to build client"),
                        );

                        let start = Instant::now();
                        for _ in 0..iters {
                            run_echo_bench(&client, shape, params).await;
                        }
                        start.elapsed()
                    });
                },
            );
        }

        group.finish();
    }
}

fn inputs(units: u32) -> impl tokio_stream::Stream<Item = Message> {
    tokio_stream::iter((0..units).map(|i| Message {
        value: f64::from(i),
    }))
}

async fn run_echo_bench(client: &Arc<Client>, shape: &'static str, params: &EchoBenchParams) {
    let mut tasks = FuturesUnordered::new();

    for _ in 0..params.concurrency {
        let client = Arc::clone(client);
        let units = params.units;

        tasks.push(tokio::spawn(async move {
            match shape {
                "range_square" => {
                    let mut stream = client
                        .range_square(Message {
                            value: f64::from(units) - 1.0,
                        })
                        .await
                        .expect("range_square failed")
                        .into_inner();
                    while let Some(unit) = stream.next().await {
                        black_box(unit.expect("unit").value);
                    }
                }
                "sum_square" => {
                    let sum = client
                        .sum_square(inputs(units))
                        .await
                        .expect("sum_square failed")
                        .into_inner();
                    black_box(sum.value);
                }
                _ => {
                    let mut stream = client
                        .streamrange_square(inputs(units))
                        .await
                        .expect("streamrange_square failed")
                        .into_inner();
                    while let Some(unit) = stream.next().await {
                        black_box(unit.expect("unit").value);
                    }
                }
            }
        }));
    }

    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

criterion_group!(echo_benches, echo_bench);
criterion_main!(echo_benches);
