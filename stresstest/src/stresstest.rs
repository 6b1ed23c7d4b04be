use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytesize::ByteSize;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::client::{ChunkyardClient, Combined};
use crate::workload::{Upload, Workload, WorkloadConfig};

#[derive(Default)]
struct Stats {
    upload_durations: DDSketch,
    combine_durations: DDSketch,
    bytes: u64,
    conflicts: usize,
    failures: usize,
}

struct Finished {
    uploaded: Duration,
    combined: Duration,
    bytes: u64,
    conflicts: usize,
}

pub async fn perform_stresstest(
    remote: ChunkyardClient,
    workloads: Vec<Workload>,
    duration: Duration,
) -> Result<()> {
    let remote = Arc::new(remote);
    // run the workloads concurrently
    let tasks: Vec<_> = workloads
        .into_iter()
        .map(|workload| {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move {
                let concurrency = workload.config.concurrency;
                let racers = workload.config.combine_racers;
                let semaphore = Arc::new(Semaphore::new(concurrency));
                let deadline = tokio::time::Instant::now() + duration;

                let workload = Arc::new(Mutex::new(workload));
                let stats = Arc::new(Mutex::new(Stats::default()));

                // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
                let sleep = tokio::time::sleep_until(deadline);
                tokio::pin!(sleep);

                loop {
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => {
                            let permit = permit?;
                            let upload = workload.lock().unwrap().next_upload()?;
                            let remote = Arc::clone(&remote);
                            let stats = Arc::clone(&stats);

                            let task = async move {
                                let upload_id = upload.upload_id.clone();
                                let outcome = run_upload(&remote, upload, racers).await;

                                let mut stats = stats.lock().unwrap();
                                match outcome {
                                    Ok(finished) => {
                                        stats.upload_durations.add(finished.uploaded.as_secs_f64());
                                        stats.combine_durations.add(finished.combined.as_secs_f64());
                                        stats.bytes += finished.bytes;
                                        stats.conflicts += finished.conflicts;
                                    }
                                    Err(err) => {
                                        eprintln!("upload {upload_id} failed: {err:#}");
                                        stats.failures += 1;
                                    }
                                }

                                drop(permit);
                            };
                            tokio::spawn(task);
                        }
                        _ = &mut sleep => {
                            break;
                        }
                    }
                }

                // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
                let _permits = semaphore.acquire_many(concurrency as u32).await?;

                let stats = std::mem::take(&mut *stats.lock().unwrap());
                let config = workload.lock().unwrap().config.clone();
                anyhow::Ok((config, stats))
            })
        })
        .collect();

    let finished_tasks = futures::future::join_all(tasks).await;

    let mut failures = 0;
    for task in finished_tasks {
        let (config, stats) = task??;
        failures += stats.failures;
        report(&config, &stats, duration)?;
    }

    if failures > 0 {
        bail!("{failures} uploads failed");
    }
    Ok(())
}

/// Sends all chunks of `upload` at once, then races `racers` combine requests.
async fn run_upload(remote: &ChunkyardClient, upload: Upload, racers: usize) -> Result<Finished> {
    let Upload {
        upload_id,
        original_name,
        total_chunks,
        len,
        hash,
        chunks,
    } = upload;

    let start = Instant::now();
    futures::future::try_join_all(chunks.into_iter().map(|(chunk_index, bytes)| {
        remote.upload_chunk(&upload_id, chunk_index, total_chunks, &original_name, bytes)
    }))
    .await?;
    let uploaded = start.elapsed();

    let start = Instant::now();
    let results =
        futures::future::join_all((0..racers).map(|_| remote.combine(&upload_id))).await;
    let combined = start.elapsed();

    let expected_hash = hash.to_hex();
    let mut artifacts = 0;
    let mut conflicts = 0;
    for result in results {
        match result? {
            Combined::Artifact(artifact) => {
                if artifact.size_bytes != len || artifact.hash != expected_hash.as_str() {
                    bail!(
                        "{} holds {} bytes hashing to {}, expected {len} bytes hashing to {expected_hash}",
                        artifact.path,
                        artifact.size_bytes,
                        artifact.hash
                    );
                }
                artifacts += 1;
            }
            Combined::Conflict => conflicts += 1,
        }
    }
    if artifacts == 0 {
        bail!("every combine request conflicted");
    }

    Ok(Finished {
        uploaded,
        combined,
        bytes: len,
        conflicts,
    })
}

fn report(config: &WorkloadConfig, stats: &Stats, duration: Duration) -> Result<()> {
    let uploads = stats.combine_durations.count();
    let uploads_ps = uploads as f64 / duration.as_secs_f64();
    println!(
        "# Workload {} (concurrency: {}, combine racers: {})",
        config.name, config.concurrency, config.combine_racers
    );
    println!(
        "  file sizes {}-{}, up to {} chunks",
        ByteSize::b(config.p50_size),
        ByteSize::b(config.p99_size),
        config.max_chunks
    );
    println!(
        "=> {uploads} uploads ({}), {uploads_ps:.2} uploads/s",
        ByteSize::b(stats.bytes)
    );
    println!(
        "  {} combines rejected as conflicting; {} failures",
        stats.conflicts, stats.failures
    );

    print_latencies("upload", &stats.upload_durations)?;
    print_latencies("combine", &stats.combine_durations)?;
    Ok(())
}

fn print_latencies(what: &str, durations: &DDSketch) -> Result<()> {
    let count = durations.count();
    if count == 0 {
        return Ok(());
    }
    let quantile = |q| -> Result<Duration> {
        let secs = durations.quantile(q)?.unwrap_or_default();
        Ok(Duration::from_secs_f64(secs))
    };

    let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / count as f64);
    let p50 = quantile(0.5)?;
    let p90 = quantile(0.9)?;
    let p99 = quantile(0.99)?;
    println!("  {what}: avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    Ok(())
}
