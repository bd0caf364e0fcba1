use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipeline_engine::{BoundedQueue, CancelNode, RateLimiter};
use std::thread;
use std::time::Duration;

/// `producers` threads each push `per_producer` items through one queue
/// drained by `consumers` threads.
fn run_queue(capacity: usize, producers: usize, consumers: usize, per_producer: usize) {
    let queue = BoundedQueue::new(capacity);
    let node = CancelNode::new();

    let consumer_handles: Vec<_> = (0..consumers)
        .map(|_| {
            let (queue, node) = (queue.clone(), node.clone());
            thread::spawn(move || queue.iter(&node).map(black_box).count())
        })
        .collect();
    let producer_handles: Vec<_> = (0..producers)
        .map(|p| {
            let (queue, node) = (queue.clone(), node.clone());
            thread::spawn(move || {
                for i in 0..per_producer {
                    let _ = queue.send(p * per_producer + i, &node);
                }
            })
        })
        .collect();

    for handle in producer_handles {
        let _ = handle.join();
    }
    let _ = queue.close();
    for handle in consumer_handles {
        let _ = handle.join();
    }
}

fn benchmark_queue_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_contention");
    for (producers, consumers) in [(1, 1), (4, 1), (4, 4), (8, 8)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}p_{}c", producers, consumers)),
            &(producers, consumers),
            |b, &(producers, consumers)| {
                b.iter(|| run_queue(64, producers, consumers, 2_000));
            },
        );
    }
    group.finish();
}

fn benchmark_small_queue_backpressure(c: &mut Criterion) {
    c.bench_function("capacity_1_queue_4p_4c", |b| {
        b.iter(|| run_queue(1, 4, 4, 500));
    });
}

fn benchmark_rate_limiter_try_acquire(c: &mut Criterion) {
    let limiter = RateLimiter::new(1_000_000, 1e9).expect("Invalid limiter");
    c.bench_function("rate_limiter_try_acquire", |b| {
        b.iter(|| black_box(limiter.try_acquire()));
    });
}

fn benchmark_cancel_tree_fan_out(c: &mut Criterion) {
    c.bench_function("cancel_1000_children", |b| {
        b.iter(|| {
            let root = CancelNode::new();
            let children: Vec<CancelNode> = (0..1000).map(|_| root.child()).collect();
            root.cancel();
            black_box(children.iter().all(CancelNode::is_done))
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = benchmark_queue_contention, benchmark_small_queue_backpressure,
        benchmark_rate_limiter_try_acquire, benchmark_cancel_tree_fan_out
);
criterion_main!(benches);
