//! The job pool.
//!
//! A fixed array of job records handed out from a monotonically increasing
//! counter, so allocating a job is a `fetch_add` and a compare-exchange, with
//! no free list and no allocation.
//!
//! Correctness rests on a slot never being handed out while its previous job
//! is still in flight. Each record tracks a small state machine
//! (free -> created -> scheduled -> free) and allocation only claims free
//! slots. The pool does not grow: asking for more live jobs than its capacity
//! is a fatal error.

use std::cell::UnsafeCell;

use crossbeam_utils::CachePadded;

use super::sync::{Ordering, AtomicI32, AtomicU8, AtomicU32, AtomicU64};
use super::job::{JobFn, JobId, ExecutionPolicy, INVALID_JOB_ID};
use super::group::{JobGroupId, INVALID_JOB_GROUP_ID};

pub(crate) const STATE_FREE: u8 = 0;
pub(crate) const STATE_CREATED: u8 = 1;
pub(crate) const STATE_SCHEDULED: u8 = 2;

/// One slot of the job pool.
pub(crate) struct JobRecord {
    // Only touched by the thread that allocated the job (before it is
    // scheduled) and by the single thread that dequeued it. Queue push/pop
    // provide the happens-before edge between the two.
    function: UnsafeCell<Option<JobFn>>,
    // 1 for the job itself plus one per unfinished child.
    unfinished: AtomicI32,
    // The full id of the current occupant.
    id: AtomicU64,
    parent: AtomicU64,
    group: AtomicU32,
    policy: AtomicU8,
    state: AtomicU8,
}

unsafe impl Sync for JobRecord {}

impl JobRecord {
    fn new() -> Self {
        JobRecord {
            function: UnsafeCell::new(None),
            unfinished: AtomicI32::new(0),
            id: AtomicU64::new(INVALID_JOB_ID.to_bits()),
            parent: AtomicU64::new(INVALID_JOB_ID.to_bits()),
            group: AtomicU32::new(INVALID_JOB_GROUP_ID.0),
            policy: AtomicU8::new(ExecutionPolicy::Worker.to_u8()),
            state: AtomicU8::new(STATE_FREE),
        }
    }

    /// Fill in a freshly allocated record.
    ///
    /// Unsafe: must only be called by the thread that allocated the record,
    /// before the job is visible to any other thread.
    pub unsafe fn init(&self, function: JobFn, policy: ExecutionPolicy, parent: JobId, group: JobGroupId) {
        *self.function.get() = Some(function);
        self.policy.store(policy.to_u8(), Ordering::Relaxed);
        self.parent.store(parent.to_bits(), Ordering::Relaxed);
        self.group.store(group.0, Ordering::Relaxed);
        self.unfinished.store(1, Ordering::Release);
    }

    /// Move the closure out of the record.
    ///
    /// Unsafe: the caller must have exclusive access to the job, either because
    /// it dequeued it or because the job was never scheduled.
    pub unsafe fn take_function(&self) -> Option<JobFn> {
        (*self.function.get()).take()
    }

    #[inline]
    pub fn id(&self) -> JobId {
        JobId::from_bits(self.id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn parent(&self) -> JobId {
        JobId::from_bits(self.parent.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn group(&self) -> JobGroupId {
        JobGroupId(self.group.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn unfinished(&self) -> i32 {
        self.unfinished.load(Ordering::Acquire)
    }

    /// Register a child. Returns the count before the increment.
    #[inline]
    pub fn add_child(&self) -> i32 {
        self.unfinished.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the number of unfinished jobs left after the decrement.
    #[inline]
    pub fn finish_one(&self) -> i32 {
        self.unfinished.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Created -> Scheduled. Returns false if the job was already scheduled or
    /// has been released.
    pub fn mark_scheduled(&self) -> bool {
        self.state
            .compare_exchange(STATE_CREATED, STATE_SCHEDULED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

pub(crate) struct JobPool {
    records: Box<[CachePadded<JobRecord>]>,
    mask: u64,
    next_id: CachePadded<AtomicU64>,
}

impl JobPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "job pool capacity must be a power of two, got {}", capacity);

        let records = (0..capacity)
            .map(|_| CachePadded::new(JobRecord::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        JobPool {
            records,
            mask: capacity as u64 - 1,
            next_id: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize { self.records.len() }

    /// Claim a free slot.
    ///
    /// Slots are visited in ring order. A slot still used by a long-lived job is
    /// skipped, so a single job outliving a full turn of the ring doesn't bring
    /// everything down; if a whole turn of the ring only finds live jobs, the
    /// pool is exhausted and we panic.
    pub fn allocate_job(&self) -> (&JobRecord, JobId) {
        for _ in 0..self.records.len() {
            let id = JobId::from_bits(self.next_id.fetch_add(1, Ordering::Relaxed));
            debug_assert!(id.is_valid());

            let record = &self.records[id.slot(self.mask)];
            let claimed = record.state
                .compare_exchange(STATE_FREE, STATE_CREATED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok();

            if !claimed {
                continue;
            }

            assert_eq!(
                record.unfinished.load(Ordering::Acquire), 0,
                "stale job in slot {}", id.slot(self.mask),
            );
            record.id.store(id.to_bits(), Ordering::Release);

            return (record, id);
        }

        panic!(
            "job pool exhausted: all {} job slots are in flight",
            self.records.len(),
        );
    }

    /// Reset a record and make its slot available again.
    ///
    /// Unsafe: the job must be retired (its counter reached zero) or must never
    /// have been scheduled, and no other thread may access its closure.
    pub unsafe fn free_job(&self, record: &JobRecord) {
        debug_assert!(record.unfinished.load(Ordering::Acquire) <= 0);
        // Drops the closure of a job that was destroyed without running.
        *record.function.get() = None;
        record.parent.store(INVALID_JOB_ID.to_bits(), Ordering::Relaxed);
        record.group.store(INVALID_JOB_GROUP_ID.0, Ordering::Relaxed);
        record.unfinished.store(0, Ordering::Relaxed);
        record.state.store(STATE_FREE, Ordering::Release);
    }

    /// Look up the slot for a job id that was handed out by this pool.
    pub fn get_job(&self, id: JobId) -> &JobRecord {
        assert!(id.is_valid(), "invalid job id");
        assert!(
            id.to_bits() < self.next_id.load(Ordering::Acquire),
            "job id {:?} was never allocated by this pool", id,
        );

        &self.records[id.slot(self.mask)]
    }

    /// Number of slots currently in use. Only meant for diagnostics.
    pub fn live_jobs(&self) -> usize {
        self.records.iter().filter(|r| r.state() != STATE_FREE).count()
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        let live = self.live_jobs();
        if live > 0 {
            tracing::debug!(live, "dropping job pool with jobs that never ran");
        }
    }
}

#[cfg(test)]
fn noop() -> JobFn {
    JobFn::new(|_| {})
}

#[test]
fn test_allocate_and_free() {
    let pool = JobPool::new(4);

    for round in 0..3u64 {
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (record, id) = pool.allocate_job();
            unsafe { record.init(noop(), ExecutionPolicy::Worker, INVALID_JOB_ID, INVALID_JOB_GROUP_ID); }
            assert_eq!(record.id(), id);
            assert_eq!(record.unfinished(), 1);
            ids.push(id);
        }

        assert_eq!(pool.live_jobs(), 4);
        assert_eq!(ids[0].to_bits(), round * 4);

        for id in ids {
            let record = pool.get_job(id);
            assert_eq!(record.finish_one(), 0);
            unsafe { pool.free_job(record); }
        }

        assert_eq!(pool.live_jobs(), 0);
    }
}

#[test]
fn test_allocation_skips_long_lived_jobs() {
    let pool = JobPool::new(4);

    let (long_lived, long_id) = pool.allocate_job();
    unsafe { long_lived.init(noop(), ExecutionPolicy::Worker, INVALID_JOB_ID, INVALID_JOB_GROUP_ID); }

    // Cycle many short jobs through the ring while the first one stays alive.
    for _ in 0..32 {
        let (record, id) = pool.allocate_job();
        assert_ne!(id.slot(3), long_id.slot(3));
        unsafe {
            record.init(noop(), ExecutionPolicy::Worker, INVALID_JOB_ID, INVALID_JOB_GROUP_ID);
            drop(record.take_function());
            record.finish_one();
            pool.free_job(record);
        }
    }

    assert_eq!(pool.get_job(long_id).id(), long_id);
    assert_eq!(pool.live_jobs(), 1);
}

#[test]
#[should_panic(expected = "job pool exhausted")]
fn test_pool_exhaustion() {
    let pool = JobPool::new(8);
    for _ in 0..9 {
        let (record, _) = pool.allocate_job();
        unsafe { record.init(noop(), ExecutionPolicy::Worker, INVALID_JOB_ID, INVALID_JOB_GROUP_ID); }
    }
}

#[test]
#[should_panic(expected = "never allocated")]
fn test_get_unallocated_job() {
    let pool = JobPool::new(8);
    pool.get_job(JobId::from_bits(3));
}

#[test]
#[should_panic(expected = "invalid job id")]
fn test_get_invalid_job() {
    let pool = JobPool::new(8);
    pool.get_job(INVALID_JOB_ID);
}
