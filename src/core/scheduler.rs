use std::thread::JoinHandle;

use super::{Shared, WorkerHook};
use super::sync::Arc;
use super::context::{JobApi, Submitter};
use super::queue::QueueBackend;

/// Owns the worker threads and the job pool.
///
/// There is meant to be one scheduler per process, built once at startup on
/// the main thread and passed around by reference. Dropping it (or calling
/// `shut_down`) stops and joins the workers.
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
    pub(crate) workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(2)
            .saturating_sub(1)
            .max(1);

        SchedulerBuilder {
            num_threads,
            pool_capacity: 4096,
            queue_capacity: None,
            max_job_groups: 64,
            queue_backend: QueueBackend::LockFree,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    pub fn pool_capacity(&self) -> usize { self.shared.pool.capacity() }

    pub fn max_job_groups(&self) -> usize { self.shared.groups.capacity() }

    /// Whether the calling thread is the one that built the scheduler.
    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.shared.main_thread
    }

    /// Run every pending `MainThread` job on the calling thread, including the
    /// ones scheduled by the jobs that run here. Returns the number of jobs
    /// executed.
    ///
    /// Must be called from the main thread, typically once per frame.
    pub fn drain_main_thread_jobs(&self) -> usize {
        assert!(
            self.is_main_thread(),
            "main thread jobs can only be drained from the thread that built the scheduler",
        );

        profiling::scope!("drain_main_thread_jobs");

        let shared = &*self.shared;
        shared.main_thread_drain.begin();

        let mut count = 0;
        while let Some(job) = shared.main_thread_queue.steal() {
            shared.execute_job(job, None, None);
            count += 1;
        }

        shared.main_thread_drain.end();

        count
    }

    /// Some counters for debugging purposes.
    pub fn stats(&self) -> Stats {
        self.shared.collect_stats()
    }

    /// Stop the worker threads and wait for them to exit.
    ///
    /// Workers finish the jobs they can find before exiting. Jobs still
    /// sitting in the main thread queue are dropped without running.
    pub fn shut_down(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        tracing::debug!(workers = self.workers.len(), "shutting down job scheduler");

        self.shared.shutdown.begin_shut_down(&self.shared.sleep);

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("a worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

impl JobApi for Scheduler {
    fn submitter(&self) -> Submitter<'_> {
        Submitter {
            shared: &*self.shared,
            local: None,
            worker: None,
            on_main_thread: self.is_main_thread(),
        }
    }
}

/// Aggregated scheduler counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of jobs executed, on any thread.
    pub jobs_executed: u64,
    /// How many of them were obtained by stealing from another worker.
    pub jobs_stolen: u64,
    /// How many times a worker went to sleep for lack of work.
    pub sleeps: u64,
}

pub struct SchedulerBuilder {
    pub(crate) num_threads: u32,
    pub(crate) pool_capacity: usize,
    pub(crate) queue_capacity: Option<usize>,
    pub(crate) max_job_groups: usize,
    pub(crate) queue_backend: QueueBackend,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl SchedulerBuilder {
    pub fn with_start_handler<F>(self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        SchedulerBuilder {
            start_handler: Some(Box::new(handler)),
            ..self
        }
    }

    pub fn with_exit_handler<F>(self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        SchedulerBuilder {
            exit_handler: Some(Box::new(handler)),
            ..self
        }
    }

    pub fn with_thread_names<F>(self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        SchedulerBuilder {
            name_handler: Box::new(handler),
            ..self
        }
    }

    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads.max(1);

        self
    }

    /// Maximum number of jobs alive at the same time. Rounded up to a power of
    /// two.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "the job pool can't be empty");
        self.pool_capacity = capacity;

        self
    }

    /// Capacity of each queue. Defaults to the pool capacity, which guarantees
    /// that queues can't overflow.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "job queues can't be empty");
        self.queue_capacity = Some(capacity);

        self
    }

    pub fn with_max_job_groups(mut self, count: usize) -> Self {
        assert!(count < u32::MAX as usize);
        self.max_job_groups = count;

        self
    }

    pub fn with_queue_backend(mut self, backend: QueueBackend) -> Self {
        self.queue_backend = backend;

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn build(self) -> Scheduler {
        crate::core::init(self)
    }
}

#[cfg(test)]
const BACKENDS: [QueueBackend; 2] = [QueueBackend::LockFree, QueueBackend::Locking];

#[cfg(test)]
fn spawn_tree(ctx: &crate::JobContext, idx: usize, depth: u32, counts: std::sync::Arc<Vec<std::sync::atomic::AtomicU32>>) {
    use std::sync::atomic::Ordering;
    const FANOUT: usize = 4;

    counts[idx].fetch_add(1, Ordering::Relaxed);
    if depth == 0 {
        return;
    }

    if depth % 2 == 0 {
        for k in 0..FANOUT {
            let counts = counts.clone();
            ctx.run_child(move |ctx| spawn_tree(ctx, idx * FANOUT + k + 1, depth - 1, counts));
        }
    } else {
        // Create the whole batch before releasing any of it.
        let children: Vec<_> = (0..FANOUT).map(|k| {
            let counts = counts.clone();
            ctx.create_child(move |ctx| spawn_tree(ctx, idx * FANOUT + k + 1, depth - 1, counts))
        }).collect();

        for child in children {
            ctx.run_job(child);
        }
    }
}

#[test]
fn test_root_with_100_children() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    for backend in BACKENDS {
        let scheduler = Scheduler::builder()
            .with_worker_threads(3)
            .with_queue_backend(backend)
            .build();

        for _ in 0..50 {
            let counter = Arc::new(AtomicU32::new(0));
            let c = counter.clone();
            let root = scheduler.create_and_run_job(move |ctx| {
                for _ in 0..100 {
                    let c = c.clone();
                    ctx.run_child(move |_| { c.fetch_add(1, Ordering::Relaxed); });
                }
            });

            scheduler.wait_for_job(root);
            assert!(scheduler.is_job_complete(root));
            assert_eq!(counter.load(Ordering::Relaxed), 100);
        }
    }
}

#[test]
fn test_job_tree_runs_every_node_once() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    // 1 + 4 + 16 + 64 + 256 nodes.
    const NUM_NODES: usize = 341;

    for backend in BACKENDS {
        for num_threads in [1, 2, 5] {
            let scheduler = Scheduler::builder()
                .with_worker_threads(num_threads)
                .with_queue_backend(backend)
                .build();

            for _ in 0..10 {
                let counts: Arc<Vec<AtomicU32>> = Arc::new((0..NUM_NODES).map(|_| AtomicU32::new(0)).collect());
                let c = counts.clone();
                let root = scheduler.create_and_run_job(move |ctx| spawn_tree(ctx, 0, 4, c));

                scheduler.wait_for_job(root);

                for (idx, count) in counts.iter().enumerate() {
                    assert_eq!(count.load(Ordering::Relaxed), 1, "node {} ({:?})", idx, backend);
                }
            }
        }
    }
}

#[test]
fn test_independent_jobs_run_exactly_once() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NUM_JOBS: usize = 2000;

    for backend in BACKENDS {
        let scheduler = Scheduler::builder()
            .with_worker_threads(4)
            .with_queue_backend(backend)
            .build();

        let counts: Arc<Vec<AtomicU32>> = Arc::new((0..NUM_JOBS).map(|_| AtomicU32::new(0)).collect());

        let group = scheduler.create_job_group();
        for i in 0..NUM_JOBS {
            let counts = counts.clone();
            scheduler.job().in_group(group).run(move |_| {
                counts[i].fetch_add(1, Ordering::Relaxed);
            });
        }
        scheduler.wait_for_job_group(group);

        let total: u32 = counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        assert_eq!(total, NUM_JOBS as u32);
        for count in counts.iter() {
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        assert!(scheduler.stats().jobs_executed >= NUM_JOBS as u64);
    }
}

#[test]
fn test_jobs_pushed_to_one_worker_run_on_a_single_thread_each() {
    use std::sync::{Arc, Mutex};
    use std::thread::ThreadId;

    for backend in BACKENDS {
        let scheduler = Scheduler::builder()
            .with_worker_threads(4)
            .with_queue_backend(backend)
            .build();

        for _ in 0..50 {
            let executed_by: Arc<Vec<Mutex<Option<ThreadId>>>> = Arc::new((0..8).map(|_| Mutex::new(None)).collect());

            let slots = executed_by.clone();
            let root = scheduler.create_and_run_job(move |ctx| {
                // All eight children land in this worker's own queue.
                for i in 0..8 {
                    let slots = slots.clone();
                    ctx.run_child(move |_| {
                        let mut slot = slots[i].lock().unwrap();
                        assert!(slot.is_none(), "job {} executed twice", i);
                        *slot = Some(std::thread::current().id());
                        drop(slot);

                        // Give the other workers a chance to steal.
                        let mut x = 0u64;
                        for n in 0..10_000u64 {
                            x = x.wrapping_mul(31).wrapping_add(n);
                        }
                        std::hint::black_box(x);
                    });
                }
            });

            scheduler.wait_for_job(root);

            for slot in executed_by.iter() {
                assert!(slot.lock().unwrap().is_some());
            }
        }
    }
}

#[test]
#[should_panic(expected = "job pool exhausted")]
fn test_creating_more_jobs_than_the_pool_capacity() {
    let scheduler = Scheduler::builder()
        .with_worker_threads(2)
        .with_pool_capacity(16)
        .build();

    assert_eq!(scheduler.pool_capacity(), 16);

    for _ in 0..16 {
        scheduler.create_job(|_| {});
    }

    scheduler.create_job(|_| {});
}

#[test]
fn test_main_thread_jobs_wait_for_the_drain() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use crate::ExecutionPolicy;

    let scheduler = Scheduler::builder().with_worker_threads(3).build();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_on_main = Arc::new(AtomicBool::new(false));

    let (r, m) = (ran.clone(), ran_on_main.clone());
    let spawner = scheduler.create_and_run_job(move |ctx| {
        assert!(ctx.is_worker_thread());
        ctx.job().with_policy(ExecutionPolicy::MainThread).run(move |ctx| {
            m.store(ctx.is_main_thread(), Ordering::SeqCst);
            r.store(true, Ordering::SeqCst);
        });
    });

    // Poll instead of wait_for_job: waiting on the main thread would run the
    // main thread job.
    while !scheduler.is_job_complete(spawner) {
        std::thread::sleep(Duration::from_millis(1));
    }

    // The workers are idle, they must leave the job alone.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));

    assert_eq!(scheduler.drain_main_thread_jobs(), 1);
    assert!(ran.load(Ordering::SeqCst));
    assert!(ran_on_main.load(Ordering::SeqCst));

    assert_eq!(scheduler.drain_main_thread_jobs(), 0);
}

#[test]
fn test_waiting_on_the_main_thread_runs_main_thread_children() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::ExecutionPolicy;

    let scheduler = Scheduler::builder().with_worker_threads(2).build();
    let counter = Arc::new(AtomicU32::new(0));

    let c = counter.clone();
    let root = scheduler.create_and_run_job(move |ctx| {
        for _ in 0..10 {
            let c = c.clone();
            ctx.job()
                .with_parent(ctx.job_id())
                .with_policy(ExecutionPolicy::MainThread)
                .run(move |ctx| {
                    assert!(ctx.is_main_thread());
                    c.fetch_add(1, Ordering::Relaxed);
                });
        }
    });

    scheduler.wait_for_job(root);
    assert_eq!(counter.load(Ordering::Relaxed), 10);
}

#[test]
fn test_results_do_not_depend_on_scheduling() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn run_graph(scheduler: &Scheduler) -> Vec<u64> {
        let results: Arc<Vec<AtomicU64>> = Arc::new((0..64).map(|_| AtomicU64::new(0)).collect());
        let r = results.clone();
        let root = scheduler.create_and_run_job(move |ctx| {
            for i in 0..64u64 {
                let r = r.clone();
                ctx.run_child(move |_| {
                    let mut acc = i;
                    for n in 0..(i * 100) {
                        acc = acc.wrapping_mul(6364136223846793005).wrapping_add(n);
                    }
                    r[i as usize].store(acc, Ordering::Relaxed);
                });
            }
        });
        scheduler.wait_for_job(root);

        results.iter().map(|r| r.load(Ordering::Relaxed)).collect()
    }

    let reference = {
        let scheduler = Scheduler::builder().with_worker_threads(1).build();
        run_graph(&scheduler)
    };

    for backend in BACKENDS {
        for num_threads in [2, 3, 7] {
            let scheduler = Scheduler::builder()
                .with_worker_threads(num_threads)
                .with_queue_backend(backend)
                .build();
            for _ in 0..5 {
                assert_eq!(run_graph(&scheduler), reference);
            }
        }
    }
}

#[test]
fn test_wait_inside_a_job() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(2).build();
    let sum = Arc::new(AtomicU32::new(0));

    let s = sum.clone();
    let root = scheduler.create_and_run_job(move |ctx| {
        for round in 0..20 {
            let s2 = s.clone();
            let job = ctx.create_and_run_job(move |ctx| {
                for _ in 0..4 {
                    let s3 = s2.clone();
                    ctx.run_child(move |_| { s3.fetch_add(1, Ordering::Relaxed); });
                }
            });
            ctx.wait_for_job(job);
            assert_eq!(s.load(Ordering::Relaxed), (round + 1) * 4);
        }
    });

    scheduler.wait_for_job(root);
    assert_eq!(sum.load(Ordering::Relaxed), 80);
}

#[test]
fn test_deep_job_chain() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn link(ctx: &crate::JobContext, remaining: u32, counter: Arc<AtomicU32>) {
        counter.fetch_add(1, Ordering::Relaxed);
        if remaining > 0 {
            ctx.run_child(move |ctx| link(ctx, remaining - 1, counter));
        }
    }

    let scheduler = Scheduler::builder()
        .with_worker_threads(2)
        .with_pool_capacity(8192)
        .build();

    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    let root = scheduler.create_and_run_job(move |ctx| link(ctx, 5000, c));

    scheduler.wait_for_job(root);
    assert_eq!(counter.load(Ordering::Relaxed), 5001);
}

#[test]
fn test_destroy_unscheduled_child() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(2).build();

    let parent_ran = Arc::new(AtomicBool::new(false));
    let child_ran = Arc::new(AtomicBool::new(false));

    let p = parent_ran.clone();
    let parent = scheduler.create_job(move |_| { p.store(true, Ordering::SeqCst); });

    let c = child_ran.clone();
    let child = scheduler.create_job_as_child(parent, move |_| { c.store(true, Ordering::SeqCst); });
    assert_eq!(Arc::strong_count(&child_ran), 2);

    scheduler.destroy_job(child);
    assert!(scheduler.is_job_complete(child));
    assert_eq!(Arc::strong_count(&child_ran), 1);

    scheduler.run_job(parent);
    scheduler.wait_for_job(parent);

    assert!(parent_ran.load(Ordering::SeqCst));
    assert!(!child_ran.load(Ordering::SeqCst));
}

#[test]
#[should_panic(expected = "already scheduled")]
fn test_scheduling_a_job_twice() {
    let scheduler = Scheduler::builder().with_worker_threads(1).build();
    let job = scheduler.create_job(|_| {});
    scheduler.run_job(job);
    scheduler.run_job(job);
}

#[test]
#[should_panic(expected = "never scheduled")]
fn test_waiting_on_an_unscheduled_job() {
    let scheduler = Scheduler::builder().with_worker_threads(1).build();
    let job = scheduler.create_job(|_| {});
    scheduler.wait_for_job(job);
}

#[test]
#[should_panic(expected = "invalid job id")]
fn test_waiting_on_an_invalid_job() {
    let scheduler = Scheduler::builder().with_worker_threads(1).build();
    scheduler.wait_for_job(crate::INVALID_JOB_ID);
}

#[test]
fn test_drain_off_the_main_thread() {
    let scheduler = Scheduler::builder().with_worker_threads(1).build();
    let result = std::thread::scope(|s| {
        s.spawn(|| scheduler.drain_main_thread_jobs()).join()
    });

    assert!(result.is_err());
}

#[test]
fn test_group_wait_from_another_thread() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(3).with_max_job_groups(4).build();
    let counter = Arc::new(AtomicU32::new(0));

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..20 {
                    let group = scheduler.create_job_group();
                    for _ in 0..32 {
                        let counter = counter.clone();
                        scheduler.job().in_group(group).run(move |_| {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                    scheduler.wait_for_job_group(group);
                }
            });
        }
    });

    assert_eq!(counter.load(Ordering::Relaxed), 4 * 20 * 32);
}

#[test]
fn test_group_with_children() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(3).build();
    let counter = Arc::new(AtomicU32::new(0));

    let group = scheduler.create_job_group();
    for _ in 0..8 {
        let c = counter.clone();
        scheduler.job().in_group(group).run(move |ctx| {
            for _ in 0..8 {
                let c = c.clone();
                ctx.run_child(move |_| { c.fetch_add(1, Ordering::Relaxed); });
            }
        });
    }

    // A group job only retires once its children have.
    scheduler.wait_for_job_group(group);
    assert_eq!(counter.load(Ordering::Relaxed), 64);

    // The slot was released and can be reused.
    for _ in 0..scheduler.max_job_groups() * 2 {
        let group = scheduler.create_job_group();
        scheduler.wait_for_job_group(group);
    }
}

#[test]
fn test_big_closures() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(2).build();
    let sum = Arc::new(AtomicU64::new(0));

    let s = sum.clone();
    let data = [3u64; 64];
    let job = scheduler.create_and_run_job(move |_| {
        s.fetch_add(data.iter().sum(), Ordering::Relaxed);
    });

    scheduler.wait_for_job(job);
    assert_eq!(sum.load(Ordering::Relaxed), 3 * 64);
}
