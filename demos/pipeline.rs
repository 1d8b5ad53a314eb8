//! Run the full pipeline once and print what happened.
//!
//! Usage: `cargo run --release --example pipeline [config.toml]`
//! Set `RUST_LOG=cluster_pipeline=debug` to watch acknowledgments.

use cluster_pipeline::{BufferCopy, JobDescriptor, MonotonicClock, Pipeline, PipelineConfig};

const PACKET: usize = 1350;

fn main() -> cluster_pipeline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("cluster_pipeline=info".parse().unwrap()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    println!("Cluster pipeline demo");
    println!("=====================\n");
    println!("{config:#?}\n");

    let n = config.job_count as usize;
    let jobs: Vec<_> = (0..n)
        .map(|i| JobDescriptor {
            user_id: (i % 8) as u32,
            src: i * PACKET,
            tgt: i * PACKET,
            len: PACKET,
        })
        .collect();
    let source: Vec<u8> = (0..n * PACKET).map(|b| (b % 251) as u8).collect();
    let copier = BufferCopy::new(source, n * PACKET);

    let pipeline = Pipeline::new(config)?;
    let report = pipeline.run(&jobs, &copier, &MonotonicClock::new())?;

    for p in &report.producers {
        println!(
            "  producer {}: {} blocks, {} bytes, {} alloc retries",
            p.worker, p.produced, p.bytes, p.alloc_retries
        );
    }
    let c = &report.consumer;
    println!(
        "  consumer:   {} blocks, {} bytes, {} copy failures",
        c.transferred, c.bytes, c.copy_failures
    );
    println!("  window:     next_seq={} ack_seq={}", c.next_seq, c.ack_seq);
    println!("  polls:      {}  acks: {}", c.polls, c.acks);
    println!(
        "  pool:       {}/{} available, {} on free list",
        report.available, report.capacity, report.free_len
    );
    println!(
        "  time:       {:.3} ms total, {:.3} ms copying",
        report.elapsed as f64 / 1e6,
        c.copy_cycles as f64 / 1e6
    );

    let intact = copier.target() == copier.source();
    println!("\nTarget matches source: {intact}");
    Ok(())
}
