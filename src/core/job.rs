use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;

use crate::core::context::JobContext;

/// Handle to a job living in the scheduler's job pool.
///
/// Ids are handed out from a monotonically increasing counter, the slot in the
/// pool is derived from the low bits. This means an id stays unique even after
/// its slot has been recycled for another job, which lets the scheduler tell
/// "finished a while ago" apart from "still running".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

/// The reserved id that never refers to a job.
pub const INVALID_JOB_ID: JobId = JobId(u64::MAX);

impl JobId {
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != INVALID_JOB_ID
    }

    #[inline]
    pub(crate) fn slot(&self, mask: u64) -> usize {
        (self.0 & mask) as usize
    }

    pub(crate) fn to_bits(self) -> u64 { self.0 }

    pub(crate) fn from_bits(bits: u64) -> Self { JobId(bits) }
}

impl Default for JobId {
    fn default() -> Self { INVALID_JOB_ID }
}

/// Where a job is allowed to run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionPolicy {
    /// Any worker thread may run the job, and threads waiting on other jobs may
    /// pick it up to keep busy.
    Worker,
    /// The job only runs when the main thread calls
    /// `Scheduler::drain_main_thread_jobs`, or while the main thread waits.
    MainThread,
}

impl ExecutionPolicy {
    // Stored in an atomic byte in the job record.
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ExecutionPolicy::Worker => 0,
            ExecutionPolicy::MainThread => 1,
        }
    }

    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            0 => ExecutionPolicy::Worker,
            _ => ExecutionPolicy::MainThread,
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self { ExecutionPolicy::Worker }
}

const INLINE_WORDS: usize = 6;

/// A type-erased `FnOnce(&JobContext)` with a small inline buffer.
///
/// Closures that fit in six machine words (which covers a handful of captured
/// `Arc`s, ids and integers) are stored in place, so scheduling them does not
/// touch the allocator. Bigger closures get boxed once and the box is stored
/// inline instead.
///
/// This is the same "deconstructed trait object" trick as `JobRef` in rayon:
/// the data is kept behind an erased pointer and carries its own call and
/// drop functions.
pub(crate) struct JobFn {
    storage: MaybeUninit<[usize; INLINE_WORDS]>,
    call_fn: unsafe fn(*mut u8, &JobContext),
    drop_fn: unsafe fn(*mut u8),
}

// The only way to build a JobFn is `JobFn::new` which requires `Send`.
unsafe impl Send for JobFn {}

impl JobFn {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce(&JobContext) + Send + 'static,
    {
        unsafe {
            if Self::fits_inline::<F>() {
                Self::new_inline(func)
            } else {
                Self::new_inline(Box::new(func))
            }
        }
    }

    #[inline]
    pub fn fits_inline<F>() -> bool {
        mem::size_of::<F>() <= mem::size_of::<[usize; INLINE_WORDS]>()
            && mem::align_of::<F>() <= mem::align_of::<usize>()
    }

    /// Unsafe: `F` must fit in the inline storage.
    unsafe fn new_inline<F>(func: F) -> Self
    where
        F: FnOnce(&JobContext) + Send,
    {
        assert!(Self::fits_inline::<F>());

        let mut storage = MaybeUninit::<[usize; INLINE_WORDS]>::uninit();
        ptr::write(storage.as_mut_ptr() as *mut F, func);

        JobFn {
            storage,
            call_fn: call_inline::<F>,
            drop_fn: drop_inline::<F>,
        }
    }

    /// Consume the closure and run it.
    pub fn call(self, ctx: &JobContext) {
        let mut this = ManuallyDrop::new(self);
        unsafe {
            (this.call_fn)(this.storage.as_mut_ptr() as *mut u8, ctx);
        }
    }
}

impl Drop for JobFn {
    fn drop(&mut self) {
        unsafe {
            (self.drop_fn)(self.storage.as_mut_ptr() as *mut u8);
        }
    }
}

unsafe fn call_inline<F>(data: *mut u8, ctx: &JobContext)
where
    F: FnOnce(&JobContext),
{
    let func = ptr::read(data as *mut F);
    func(ctx);
}

unsafe fn drop_inline<F>(data: *mut u8) {
    ptr::drop_in_place(data as *mut F);
}

/// Aborts the process if dropped while unwinding out of a job body.
///
/// A job that does not run to completion never decrements its counter, which
/// would leave its whole ancestor chain waiting forever.
pub(crate) struct AbortIfPanic {
    pub job: JobId,
}

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        tracing::error!(job = self.job.0, "job panicked; aborting");
        eprintln!("unexpected panic in job {:?}; aborting", self.job);
        ::std::process::abort();
    }
}

#[test]
fn test_inline_and_boxed_closures() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    let small = Arc::new(AtomicU32::new(0));
    let big = Arc::new(AtomicU32::new(0));

    let s = small.clone();
    let small_fn = move |_: &JobContext| { s.fetch_add(1, Ordering::Relaxed); };
    assert!(JobFn::fits_inline::<Arc<AtomicU32>>());

    let b = big.clone();
    let payload = [7u64; 32];
    let big_fn = move |_: &JobContext| {
        b.fetch_add(payload.iter().sum::<u64>() as u32, Ordering::Relaxed);
    };
    assert!(!JobFn::fits_inline::<[u64; 32]>());

    let small_job = JobFn::new(small_fn);
    let big_job = JobFn::new(big_fn);

    let scheduler = crate::Scheduler::builder().with_worker_threads(1).build();
    let ctx = JobContext::new(&scheduler.shared, None, INVALID_JOB_ID, None);
    small_job.call(&ctx);
    big_job.call(&ctx);

    assert_eq!(small.load(Ordering::Relaxed), 1);
    assert_eq!(big.load(Ordering::Relaxed), 7 * 32);
}

#[test]
fn test_dropping_uncalled_closure_releases_captures() {
    use std::sync::Arc;

    let inline = Arc::new(());
    let boxed = Arc::new(());

    let i = inline.clone();
    let job = JobFn::new(move |_: &JobContext| { let _keep = &i; });
    assert_eq!(Arc::strong_count(&inline), 2);
    drop(job);
    assert_eq!(Arc::strong_count(&inline), 1);

    let b = boxed.clone();
    let padding = [0u8; 256];
    let job = JobFn::new(move |_: &JobContext| { let _keep = (&b, padding); });
    assert_eq!(Arc::strong_count(&boxed), 2);
    drop(job);
    assert_eq!(Arc::strong_count(&boxed), 1);
}
