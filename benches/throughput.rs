use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipeline_engine::{
    CancelNode, EngineConfig, Job, MapStage, PassthroughStage, PipelineBuilder, Result, WorkerPool,
};
use std::thread;
use std::time::Duration;

fn run_pool(workers: usize, jobs: u64) {
    let root = CancelNode::new();
    let config = EngineConfig::builder()
        .name("bench")
        .workers(workers)
        .queue_capacity(256)
        .build()
        .expect("Invalid config");
    let pool = WorkerPool::start(config, &root, |job: &Job<u64>, _: &CancelNode| {
        Ok(black_box(job.payload().wrapping_mul(31)))
    })
    .expect("Start failed");

    let results = pool.results();
    let consumer = thread::spawn(move || {
        let node = CancelNode::new();
        results.iter(&node).count()
    });
    for n in 0..jobs {
        let _ = pool.submit(black_box(n));
    }
    let _ = pool.shutdown(Duration::from_secs(30));
    let _ = consumer.join();
}

fn benchmark_pool_single_worker(c: &mut Criterion) {
    c.bench_function("pool_1_worker_10000_jobs", |b| b.iter(|| run_pool(1, 10_000)));
}

fn benchmark_pool_four_workers(c: &mut Criterion) {
    c.bench_function("pool_4_workers_10000_jobs", |b| b.iter(|| run_pool(4, 10_000)));
}

fn benchmark_three_stage_pipeline(c: &mut Criterion) {
    c.bench_function("three_stage_1000_msgs", |b| {
        b.iter(|| {
            let root = CancelNode::new();
            let pipeline = PipelineBuilder::new(1000, &root)
                .expect("Build failed")
                .stage("stage1", 1, |_| PassthroughStage)
                .expect("Stage failed")
                .stage("stage2", 1, |_| {
                    MapStage::new("checksum", |data: Vec<u8>| -> Result<u64> {
                        Ok(data.iter().map(|&b| u64::from(b)).sum())
                    })
                })
                .expect("Stage failed")
                .stage("stage3", 1, |_| PassthroughStage)
                .expect("Stage failed")
                .build()
                .expect("Build failed");

            let output = pipeline.output();
            let consumer = thread::spawn(move || {
                let node = CancelNode::new();
                output.iter(&node).count()
            });
            for i in 0..1000 {
                let data = vec![i as u8; 64]; // 64 bytes per message
                let _ = pipeline.send(black_box(data));
            }
            let _ = pipeline.shutdown(Duration::from_secs(30));
            let _ = consumer.join();
        });
    });
}

fn benchmark_fan_out_pipeline(c: &mut Criterion) {
    c.bench_function("fan_out_4_1000_msgs", |b| {
        b.iter(|| {
            let root = CancelNode::new();
            let pipeline = PipelineBuilder::new(256, &root)
                .expect("Build failed")
                .stage("slow", 4, |_| {
                    MapStage::new("slow", |n: u32| -> Result<u32> {
                        thread::sleep(Duration::from_micros(20));
                        Ok(n)
                    })
                })
                .expect("Stage failed")
                .build()
                .expect("Build failed");

            let output = pipeline.output();
            let consumer = thread::spawn(move || {
                let node = CancelNode::new();
                output.iter(&node).count()
            });
            for i in 0..1000 {
                let _ = pipeline.send(black_box(i));
            }
            let _ = pipeline.shutdown(Duration::from_secs(30));
            let _ = consumer.join();
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_pool_single_worker, benchmark_pool_four_workers,
        benchmark_three_stage_pipeline, benchmark_fan_out_pipeline
);
criterion_main!(benches);
