pub mod job;
pub mod pool;
pub mod deque;
pub mod locking_queue;
pub mod queue;
pub mod group;
pub mod context;
pub mod scheduler;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use std::mem;

use crossbeam_utils::{Backoff, CachePadded};

use sync::{Arc, Ordering, AtomicU32, AtomicU64, Mutex, Condvar, thread};
use job::{JobFn, JobId, ExecutionPolicy, AbortIfPanic};
use pool::{JobPool, STATE_CREATED};
use group::{JobGroupTable, JobGroupId};
use queue::{LocalQueue, RemoteQueue, worker_queue};
use locking_queue::LockingQueue;
use context::JobContext;
use scheduler::{Scheduler, SchedulerBuilder, Stats};
use shutdown::Shutdown;
use crate::util::ExclusiveCheck;

/// Data accessible from any thread.
///
/// Everything the scheduler shares between threads lives here: the job pool,
/// the group table and the thief ends of all queues. Workers only keep the
/// owner end of their local queue for themselves.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    pub pool: JobPool,
    pub groups: JobGroupTable,
    /// The thief end of each worker's local queue.
    pub remote_queues: Vec<CachePadded<RemoteQueue>>,
    /// Per-worker queues that any thread can push to. Jobs scheduled from
    /// outside of the workers land here.
    pub inboxes: Vec<CachePadded<LockingQueue>>,
    /// Round-robin cursor for picking an inbox.
    pub next_inbox: CachePadded<AtomicU32>,
    pub main_thread_queue: LockingQueue,
    /// The thread that built the scheduler.
    pub main_thread: std::thread::ThreadId,
    pub main_thread_drain: ExclusiveCheck<&'static str>,
    /// State and logic to put worker threads to sleep and wake them up.
    pub sleep: Sleep,
    pub shutdown: Shutdown,
    /// One entry per worker plus a last one shared by all other threads.
    pub stats: Vec<CachePadded<WorkerStats>>,
    handlers: WorkerHooks,
}

pub(crate) fn init(params: SchedulerBuilder) -> Scheduler {
    let num_threads = params.num_threads as usize;
    let pool_capacity = params.pool_capacity.next_power_of_two();
    let queue_capacity = params.queue_capacity.unwrap_or(pool_capacity);

    let mut locals = Vec::with_capacity(num_threads);
    let mut remote_queues = Vec::with_capacity(num_threads);
    let mut inboxes = Vec::with_capacity(num_threads);
    for _ in 0..num_threads {
        let (local, remote) = worker_queue(params.queue_backend, queue_capacity);
        locals.push(local);
        remote_queues.push(CachePadded::new(remote));
        inboxes.push(CachePadded::new(LockingQueue::with_capacity(queue_capacity)));
    }

    let shared = Arc::new(Shared {
        num_workers: num_threads as u32,
        pool: JobPool::new(pool_capacity),
        groups: JobGroupTable::new(params.max_job_groups),
        remote_queues,
        inboxes,
        next_inbox: CachePadded::new(AtomicU32::new(0)),
        main_thread_queue: LockingQueue::with_capacity(queue_capacity),
        main_thread: std::thread::current().id(),
        main_thread_drain: ExclusiveCheck::with_tag("drain_main_thread_jobs"),
        sleep: Sleep::new(),
        shutdown: Shutdown::new(),
        stats: (0..=num_threads).map(|_| CachePadded::new(WorkerStats::default())).collect(),
        handlers: WorkerHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    tracing::debug!(
        workers = num_threads,
        pool_capacity,
        queue_capacity,
        backend = ?params.queue_backend,
        "starting job scheduler",
    );

    let mut workers = Vec::with_capacity(num_threads);
    for (i, local) in locals.into_iter().enumerate() {
        let worker = Worker {
            index: i as u32,
            local,
            shared: shared.clone(),
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();
        }).expect("failed to spawn a worker thread");

        workers.push(handle);
    }

    Scheduler { shared, workers }
}

impl Shared {
    /// Allocate a job and fill in its record. If `schedule` is true the job is
    /// also pushed to a queue.
    pub fn create_job(
        &self,
        local: Option<&LocalQueue>,
        function: JobFn,
        policy: ExecutionPolicy,
        parent: JobId,
        group: JobGroupId,
        schedule: bool,
    ) -> JobId {
        // The parent must account for the child before the child can possibly
        // run and retire, otherwise the parent's counter could hit zero early.
        if parent.is_valid() {
            let parent_record = self.pool.get_job(parent);
            assert_eq!(parent_record.id(), parent, "parent job {:?} has already been retired", parent);
            let prev = parent_record.add_child();
            assert!(prev > 0, "parent job {:?} has already finished", parent);
        }

        if group.is_valid() {
            self.groups.add_job(group);
        }

        let (record, id) = self.pool.allocate_job();
        unsafe {
            record.init(function, policy, parent, group);
        }

        if schedule {
            self.run_job(id, local);
        }

        id
    }

    /// Push an already created job to the queue its policy selects.
    pub fn run_job(&self, id: JobId, local: Option<&LocalQueue>) {
        let record = self.pool.get_job(id);
        assert_eq!(record.id(), id, "job {:?} has already been retired", id);
        assert!(record.mark_scheduled(), "job {:?} was already scheduled or destroyed", id);

        // Read before pushing: once pushed the job may run and retire at any time.
        match record.policy() {
            ExecutionPolicy::MainThread => {
                self.main_thread_queue.push(id);
            }
            ExecutionPolicy::Worker => {
                match local {
                    Some(queue) => queue.push(id),
                    None => {
                        let idx = self.next_inbox.fetch_add(1, Ordering::Relaxed) % self.num_workers;
                        self.inboxes[idx as usize].push(id);
                    }
                }

                self.sleep.wake_all();
            }
        }
    }

    /// Release a job that was created but never scheduled.
    ///
    /// The job counts as finished: its parent and group are notified.
    pub fn destroy_job(&self, id: JobId) {
        let record = self.pool.get_job(id);
        assert_eq!(record.id(), id, "job {:?} has already been retired", id);
        assert_eq!(record.state(), STATE_CREATED, "job {:?} has already been scheduled", id);
        assert_eq!(record.unfinished(), 1, "job {:?} still has unfinished children", id);

        drop(unsafe { record.take_function() });

        self.finish_job(id);
    }

    /// Run the completion cascade for a job whose body is done.
    ///
    /// Walks up the parent chain for as long as counters reach zero, so the
    /// stack depth doesn't depend on the depth of the job tree.
    pub fn finish_job(&self, id: JobId) {
        let mut id = id;
        loop {
            let record = self.pool.get_job(id);
            let remaining = record.finish_one();
            assert!(remaining >= 0, "job {:?} finished more than once", id);

            if remaining > 0 {
                return;
            }

            let parent = record.parent();
            let group = record.group();

            unsafe {
                self.pool.free_job(record);
            }

            if group.is_valid() {
                self.groups.finish_job(group);
            }

            if !parent.is_valid() {
                return;
            }

            id = parent;
        }
    }

    pub fn is_job_complete(&self, id: JobId) -> bool {
        let record = self.pool.get_job(id);
        // Load the counter first: if it belongs to a newer occupant, the id
        // load below is guaranteed to see that occupant's id.
        let remaining = record.unfinished();
        remaining == 0 || record.id() != id
    }

    pub fn execute_job(&self, id: JobId, local: Option<&LocalQueue>, worker: Option<u32>) {
        profiling::scope!("execute_job");

        let record = self.pool.get_job(id);
        debug_assert_eq!(record.id(), id);

        let function = match unsafe { record.take_function() } {
            Some(function) => function,
            None => panic!("job {:?} was executed twice", id),
        };

        let ctx = JobContext::new(self, local, id, worker);

        let abort = AbortIfPanic { job: id };
        function.call(&ctx);
        mem::forget(abort);

        self.finish_job(id);

        self.stats_for(worker).jobs_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Find a job the calling thread is allowed to run.
    ///
    /// Looks in order at the main thread queue (only on the main thread), the
    /// worker's own queue and inbox, then tries to steal from the other
    /// workers.
    pub fn find_job(&self, local: Option<&LocalQueue>, worker: Option<u32>, on_main_thread: bool) -> Option<JobId> {
        if on_main_thread {
            if let Some(job) = self.main_thread_queue.steal() {
                return Some(job);
            }
        }

        if let Some(job) = local.and_then(|queue| queue.pop()) {
            return Some(job);
        }

        if let Some(idx) = worker {
            if let Some(job) = self.inboxes[idx as usize].pop() {
                return Some(job);
            }
        }

        let job = self.steal(worker);
        if job.is_some() {
            self.stats_for(worker).jobs_stolen.fetch_add(1, Ordering::Relaxed);
        }

        job
    }

    /// Attempt to steal one job from another worker.
    ///
    /// Sweeps every other worker once, starting with the one after the caller.
    /// A lost race on one queue moves on to the next queue rather than retrying.
    fn steal(&self, worker: Option<u32>) -> Option<JobId> {
        profiling::scope!("steal");

        let n = self.num_workers;
        let start = match worker {
            Some(idx) => idx + 1,
            None => self.next_inbox.load(Ordering::Relaxed),
        };

        for i in 0..n {
            let idx = (start + i) % n;
            if Some(idx) == worker {
                continue;
            }

            let idx = idx as usize;
            if let Some(job) = self.remote_queues[idx].steal() {
                return Some(job);
            }

            if let Some(job) = self.inboxes[idx].steal() {
                return Some(job);
            }
        }

        None
    }

    /// Attempt to fetch or steal one job and execute it.
    ///
    /// Return false if we couldn't find a job to execute.
    pub fn keep_busy(&self, local: Option<&LocalQueue>, worker: Option<u32>, on_main_thread: bool) -> bool {
        match self.find_job(local, worker, on_main_thread) {
            Some(job) => {
                self.execute_job(job, local, worker);
                true
            }
            None => false,
        }
    }

    /// Spin until the job and all of its descendants are done, running other
    /// jobs in the mean time.
    pub fn wait_for_job(&self, id: JobId, local: Option<&LocalQueue>, worker: Option<u32>, on_main_thread: bool) {
        profiling::scope!("wait_for_job");

        let record = self.pool.get_job(id);
        let never_scheduled = record.state() == STATE_CREATED
            && record.unfinished() > 0
            && record.id() == id;
        assert!(!never_scheduled, "waiting on job {:?} which was never scheduled", id);

        let backoff = Backoff::new();
        while !self.is_job_complete(id) {
            if self.keep_busy(local, worker, on_main_thread) {
                backoff.reset();
            } else {
                backoff.spin();
            }
        }
    }

    /// Wait until every job of the group is done, then release the group.
    pub fn wait_for_job_group(&self, group: JobGroupId, local: Option<&LocalQueue>, worker: Option<u32>, on_main_thread: bool) {
        profiling::scope!("wait_for_job_group");

        let backoff = Backoff::new();
        while !self.groups.is_complete(group) {
            if self.keep_busy(local, worker, on_main_thread) {
                backoff.reset();
                continue;
            }

            // Workers and the main thread must keep polling their queues. Other
            // threads have nothing to help with once the queues are empty.
            if worker.is_some() || on_main_thread || !backoff.is_completed() {
                backoff.snooze();
                continue;
            }

            profiling::scope!("wait(condvar)");
            self.groups.block_until_complete(group);
        }

        self.groups.release(group);
    }

    fn stats_for(&self, worker: Option<u32>) -> &WorkerStats {
        let idx = worker.unwrap_or(self.num_workers) as usize;
        &self.stats[idx]
    }

    pub fn collect_stats(&self) -> Stats {
        let mut stats = Stats::default();
        for s in &self.stats {
            stats.jobs_executed += s.jobs_executed.load(Ordering::Relaxed);
            stats.jobs_stolen += s.jobs_stolen.load(Ordering::Relaxed);
            stats.sleeps += s.sleeps.load(Ordering::Relaxed);
        }

        stats
    }
}

#[derive(Default)]
pub(crate) struct WorkerStats {
    pub jobs_executed: AtomicU64,
    pub jobs_stolen: AtomicU64,
    pub sleeps: AtomicU64,
}

/// Puts idle workers to sleep on a shared condition variable and wakes all of
/// them whenever a job is pushed.
///
/// Pushing bumps `epoch`. A worker reads the epoch before looking for work and
/// only goes to sleep if it hasn't moved by the time it holds the lock, so a
/// job pushed while the worker was searching is never missed.
pub(crate) struct Sleep {
    epoch: CachePadded<AtomicU64>,
    sleepers: CachePadded<AtomicU32>,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Sleep {
    fn new() -> Self {
        Sleep {
            epoch: CachePadded::new(AtomicU64::new(0)),
            sleepers: CachePadded::new(AtomicU32::new(0)),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Wake all sleeping workers. Cheap when nobody sleeps.
    pub fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }

        profiling::scope!("wake workers");
        drop(self.mutex.lock().unwrap());
        self.cond.notify_all();
    }

    /// Returns whether the thread actually went to sleep.
    fn sleep(&self, seen_epoch: u64, shutdown: &Shutdown) -> bool {
        let guard = self.mutex.lock().unwrap();
        self.sleepers.fetch_add(1, Ordering::SeqCst);

        let slept = self.epoch.load(Ordering::SeqCst) == seen_epoch && !shutdown.is_shutting_down();
        let guard = if slept {
            self.cond.wait(guard).unwrap()
        } else {
            guard
        };

        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        drop(guard);

        slept
    }
}

struct Worker {
    index: u32,
    local: LocalQueue,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(&self) {
        let shared = &*self.shared;
        let worker = Some(self.index);

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.index);
        }

        tracing::debug!(worker = self.index, "worker started");

        loop {
            let epoch = shared.sleep.epoch();

            if let Some(job) = shared.find_job(Some(&self.local), worker, false) {
                shared.execute_job(job, Some(&self.local), worker);
                continue;
            }

            // Only this worker pushes to its local queue, so nothing can have
            // been added to it since the search above.
            debug_assert!(self.local.is_empty());

            if shared.shutdown.is_shutting_down() {
                break;
            }

            // Couldn't find work to do in our or another worker's queue, so
            // it's sleepy time.
            tracing::trace!(worker = self.index, "worker going to sleep");
            if shared.sleep.sleep(epoch, &shared.shutdown) {
                shared.stats[self.index as usize].sleeps.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Shutdown phase.

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.index);
        }

        tracing::debug!(worker = self.index, "worker exiting");
    }
}

pub(crate) struct WorkerHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

/// A callback invoked on a worker thread when it starts or exits, with the
/// worker's index.
pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
