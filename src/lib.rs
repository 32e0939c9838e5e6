//! A fork-join job scheduler.
//!
//! Jobs are closures stored in a fixed-capacity pool and identified by a
//! `JobId`. A job can be created as the child of another job, in which case
//! the parent is only complete once all of its descendants are. Worker threads
//! each own a work-stealing queue: they push and pop at one end and steal from
//! each other at the other end.
//!
//! What we want:
//! - No allocation per job on the hot path (small closures are stored inline).
//! - No implicit global scheduler. The `Scheduler` is built once and passed
//!   around by reference; jobs receive a `JobContext` with the same API.
//! - Some jobs must run on the main thread (for example because they touch
//!   thread-bound resources). They are queued separately and only run when the
//!   main thread drains them or waits.
//! - Capacity and contract violations (pool exhaustion, queue overflow,
//!   scheduling a job twice...) are bugs in the caller and panic right away,
//!   rather than silently losing a job and leaving its ancestors waiting forever.
//!
//! ```
//! use jobsys::{Scheduler, JobApi};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! let scheduler = Scheduler::builder().with_worker_threads(3).build();
//! let counter = Arc::new(AtomicU32::new(0));
//!
//! let c = counter.clone();
//! let root = scheduler.create_and_run_job(move |ctx| {
//!     for _ in 0..100 {
//!         let c = c.clone();
//!         ctx.run_child(move |_| { c.fetch_add(1, Ordering::Relaxed); });
//!     }
//! });
//!
//! scheduler.wait_for_job(root);
//! assert_eq!(counter.load(Ordering::Relaxed), 100);
//! ```

mod core;
pub mod util;

pub use crate::core::job::{JobId, INVALID_JOB_ID, ExecutionPolicy};
pub use crate::core::group::{JobGroupId, INVALID_JOB_GROUP_ID};
pub use crate::core::context::{JobContext, JobApi, JobBuilder, Submitter};
pub use crate::core::scheduler::{Scheduler, SchedulerBuilder, Stats};
pub use crate::core::queue::QueueBackend;
pub use crate::core::deque::{WorkStealingQueue, Stealer};
pub use crate::core::locking_queue::LockingQueue;
pub use crate::core::WorkerHook;
pub use crate::core::sync;

pub use crossbeam_utils::CachePadded;
