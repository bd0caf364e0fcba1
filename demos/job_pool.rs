//! Rate-limited worker pool with per-job timeouts
//!
//! Two producer threads submit simulated jobs of varying cost. Some jobs fail,
//! one panics, and the slowest ones exceed the per-job timeout. The pool is
//! then shut down with a short grace period and the report printed as JSON.
//!
//! Usage: cargo run --example job_pool --release
//!        RUST_LOG=pipeline_engine=debug shows worker lifecycle events.

use pipeline_engine::{CancelNode, EngineConfig, Job, PipelineError, WorkerPool};
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Simulated work: sleeps `cost` milliseconds unless its node finishes first
fn simulate(job: &Job<u64>, node: &CancelNode) -> pipeline_engine::Result<u64> {
    let cost = *job.payload();
    if cost == 13 {
        panic!("unlucky job {}", job.id());
    }
    if cost % 7 == 0 {
        return Err(PipelineError::job(format!("cost {} is not supported", cost)));
    }
    if let Some(reason) = node.wait_timeout(Duration::from_millis(cost)) {
        return Err(reason.into());
    }
    Ok(cost * 2)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "job_pool=info,pipeline_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = EngineConfig::builder()
        .name("demo")
        .workers(4)
        .queue_capacity(16)
        .rate_limit(200.0, 20)
        .per_job_timeout(Duration::from_millis(40))
        .grace_period(Duration::from_millis(500))
        .build()?;
    info!(config = ?config, "starting pool");

    let root = CancelNode::new();
    let pool = WorkerPool::start(config, &root, simulate)?;

    let results = pool.results();
    let consumer = thread::spawn(move || {
        let node = CancelNode::new();
        let mut ok = 0;
        let mut failed = 0;
        for result in results.iter(&node) {
            match &result.outcome {
                Ok(_) => ok += 1,
                Err(err) => {
                    failed += 1;
                    info!(job = %result.job_id, %err, "job did not succeed");
                }
            }
        }
        (ok, failed)
    });

    let producers: Vec<_> = (0..2u64)
        .map(|p| {
            let submitter = pool.submitter();
            thread::spawn(move || {
                for n in 0..50u64 {
                    let cost = (n * 3 + p) % 60;
                    if let Err(err) = submitter.submit(cost) {
                        info!(%err, "submission stopped");
                        break;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().map_err(|_| "producer thread panicked")?;
    }

    println!("Workers: {:?}", pool.worker_states());
    println!("Live: {}", pool.stats().format());

    let report = pool.shutdown_graceful();
    let (ok, failed) = consumer.join().map_err(|_| "consumer thread panicked")?;

    println!("\nDelivered {} ok, {} failed", ok, failed);
    println!("Completed: {}, abandoned: {}", report.completed(), report.abandoned());
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
