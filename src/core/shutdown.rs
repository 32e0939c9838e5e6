/// Shutdown
///
/// Workers check whether the scheduler is shutting down by reading an atomic
/// that is set when the shutdown starts, right before they would go to sleep.
/// Starting the shutdown wakes everyone up so that sleeping workers notice it;
/// the scheduler then joins the worker threads.

use crate::core::sync::{Ordering, AtomicBool};
use crate::core::Sleep;

pub(crate) struct Shutdown {
    pub is_shutting_down: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
        }
    }

    pub fn begin_shut_down(&self, sleep: &Sleep) {
        self.is_shutting_down.store(true, Ordering::SeqCst);

        sleep.wake_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::Scheduler;
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..20 {
        for num_threads in 1..12 {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let scheduler = Scheduler::builder()
                .with_worker_threads(num_threads)
                .with_pool_capacity(64)
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build();

            scheduler.shut_down();

            assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), num_threads);
            assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), num_threads);
        }
    }
}

#[test]
fn test_shutdown_while_busy() {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use crate::{Scheduler, JobApi};

    let counter = Arc::new(AtomicU32::new(0));
    let scheduler = Scheduler::builder().with_worker_threads(4).build();

    for _ in 0..200 {
        let counter = counter.clone();
        scheduler.create_and_run_job(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    // Dropping the scheduler shuts it down. Workers drain what they can see
    // before exiting, so no job is left half done.
    drop(scheduler);

    assert_eq!(counter.load(Ordering::Relaxed), 200);
}
