use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jobsys::{JobApi, JobContext, JobId, QueueBackend, Scheduler, WorkStealingQueue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn fork(ctx: &JobContext, depth: u32, counter: Arc<AtomicU64>) {
    counter.fetch_add(1, Ordering::Relaxed);
    if depth == 0 {
        return;
    }

    for _ in 0..4 {
        let counter = counter.clone();
        ctx.run_child(move |ctx| fork(ctx, depth - 1, counter));
    }
}

fn bench_fork_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("fork_join");
    group.sample_size(20);

    // 4^0 + 4^1 + ... + 4^6
    let depth = 6;
    let nodes = (0..=depth).map(|d| 4u64.pow(d)).sum::<u64>();
    group.throughput(Throughput::Elements(nodes));

    for backend in [QueueBackend::LockFree, QueueBackend::Locking] {
        let scheduler = Scheduler::builder()
            .with_pool_capacity(8192)
            .with_queue_backend(backend)
            .build();

        group.bench_function(BenchmarkId::new("tree", format!("{:?}", backend)), |b| {
            b.iter(|| {
                let counter = Arc::new(AtomicU64::new(0));
                let c = counter.clone();
                let root = scheduler.create_and_run_job(move |ctx| fork(ctx, depth, c));
                scheduler.wait_for_job(root);
                assert_eq!(counter.load(Ordering::Relaxed), nodes);
            });
        });
    }

    group.finish();
}

fn bench_owner_push_pop(c: &mut Criterion) {
    const N: usize = 1024;

    let mut group = c.benchmark_group("push_pop");
    group.throughput(Throughput::Elements(N as u64));

    group.bench_function("jobsys", |b| {
        let queue = WorkStealingQueue::with_capacity(N);
        b.iter(|| {
            for _ in 0..N {
                queue.push(JobId::default());
            }
            while let Some(job) = queue.pop() {
                black_box(job);
            }
        });
    });

    group.bench_function("crossbeam-deque", |b| {
        let queue = crossbeam_deque::Worker::new_lifo();
        b.iter(|| {
            for _ in 0..N {
                queue.push(JobId::default());
            }
            while let Some(job) = queue.pop() {
                black_box(job);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fork_join, bench_owner_push_pop);
criterion_main!(benches);
