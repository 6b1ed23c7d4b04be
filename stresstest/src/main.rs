use std::time::Duration;

use clap::Parser;

use crate::client::ChunkyardClient;
use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod client;
mod stresstest;
mod workload;

/// Drives a running chunkyard server with concurrent chunked uploads.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "CHUNKYARD_URL", default_value = "http://127.0.0.1:3000")]
    url: String,

    /// Uploads in flight per workload
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// How long to keep starting new uploads, in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Combine requests fired at once for every upload
    #[arg(long, default_value_t = 3)]
    racers: usize,

    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // start a server first: cargo run --release -p chunkyard -- --data-dir /tmp/chunkyard
    let remote = ChunkyardClient {
        base_url: args.url.trim_end_matches('/').into(),
        client: reqwest::Client::new(),
    };

    let builders = [
        Workload::builder("small")
            .size_distribution(16 * 1024, 1024 * 1024) // p50 = 16K, p99 = 1M
            .max_chunks(4),
        Workload::builder("large")
            .size_distribution(1024 * 1024, 64 * 1024 * 1024) // p50 = 1M, p99 = 64M
            .max_chunks(64),
    ];
    let workloads = builders
        .into_iter()
        .map(|builder| {
            let builder = builder
                .concurrency(args.concurrency)
                .combine_racers(args.racers);
            match args.seed {
                Some(seed) => builder.seed(seed),
                None => builder,
            }
            .build()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    perform_stresstest(remote, workloads, Duration::from_secs(args.duration)).await
}
