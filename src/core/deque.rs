//! A fixed-capacity Chase-Lev work-stealing deque of job ids.
//!
//! The owner pushes and pops at the bottom (LIFO), thieves steal at the top
//! (FIFO). Claims are arbitrated by a single compare-exchange on `top`, so a
//! given element is handed to exactly one caller: either the owner's `pop` or
//! one thief's `steal`.
//!
//! The owner side (`WorkStealingQueue`) is `Send` but not `Sync`, which is what
//! guarantees that `push` and `pop` are only ever called by one thread at a time.
//! Any number of `Stealer`s can be cloned and shared across threads.
//!
//! Elements are plain integers, so the ring buffer is made of atomics and a
//! thief reading a slot that the owner is overwriting is a benign race instead
//! of undefined behavior: the thief's compare-exchange on `top` fails and the
//! value is discarded.
//!
//! Memory orderings follow "Correct and Efficient Work-Stealing for Weak Memory
//! Models" (Lê et al. 2013).

use std::cell::Cell;
use std::marker::PhantomData;

use crossbeam_utils::CachePadded;

use super::sync::{fence, Arc, Ordering, AtomicI64, AtomicU64};
use super::job::JobId;

struct Inner {
    // Index of the oldest element. Only ever incremented, by a successful
    // steal or by the owner winning the race for the last element.
    top: CachePadded<AtomicI64>,
    // One past the newest element. Only written by the owner.
    bottom: CachePadded<AtomicI64>,
    buffer: Box<[AtomicU64]>,
    mask: i64,
}

impl Inner {
    #[inline]
    fn slot(&self, index: i64) -> &AtomicU64 {
        &self.buffer[(index & self.mask) as usize]
    }

    fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        (b - t).max(0) as usize
    }

    fn steal(&self) -> Option<JobId> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return None;
        }

        // Read the element before claiming it. If the claim fails the value may
        // be garbage but it is dropped without being looked at.
        let job = self.slot(t).load(Ordering::Relaxed);

        if self.top.compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed).is_err() {
            // Lost the race against the owner or another thief. The caller moves
            // on to another queue rather than spinning here.
            return None;
        }

        Some(JobId::from_bits(job))
    }
}

/// The owner end of the deque.
pub struct WorkStealingQueue {
    inner: Arc<Inner>,
    // Not Sync: push/pop are owner-only.
    _marker: PhantomData<Cell<()>>,
}

/// The thief end of the deque.
#[derive(Clone)]
pub struct Stealer {
    inner: Arc<Inner>,
}

impl WorkStealingQueue {
    /// Create a deque holding up to `capacity` jobs (rounded up to a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        WorkStealingQueue {
            inner: Arc::new(Inner {
                top: CachePadded::new(AtomicI64::new(0)),
                bottom: CachePadded::new(AtomicI64::new(0)),
                buffer,
                mask: capacity as i64 - 1,
            }),
            _marker: PhantomData,
        }
    }

    pub fn stealer(&self) -> Stealer {
        Stealer { inner: self.inner.clone() }
    }

    pub fn capacity(&self) -> usize { self.inner.buffer.len() }

    pub fn push(&self, job: JobId) {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let t = inner.top.load(Ordering::Acquire);

        if b - t >= inner.buffer.len() as i64 {
            panic!("job queue overflow: capacity of {} jobs exceeded", inner.buffer.len());
        }

        inner.slot(b).store(job.to_bits(), Ordering::Relaxed);
        // Publish the element (and the job record it refers to) before the new
        // bottom becomes visible to thieves.
        fence(Ordering::Release);
        inner.bottom.store(b + 1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<JobId> {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed) - 1;
        inner.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = inner.top.load(Ordering::Relaxed);

        if t > b {
            // Already empty.
            inner.bottom.store(t, Ordering::Relaxed);
            return None;
        }

        let job = inner.slot(b).load(Ordering::Relaxed);

        if t < b {
            // More than one element left, thieves can't reach this one.
            return Some(JobId::from_bits(job));
        }

        // Last element: race the thieves for it.
        let won = inner.top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        inner.bottom.store(t + 1, Ordering::Relaxed);

        if won { Some(JobId::from_bits(job)) } else { None }
    }

    pub fn steal(&self) -> Option<JobId> {
        self.inner.steal()
    }

    pub fn len(&self) -> usize { self.inner.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Stealer {
    pub fn steal(&self) -> Option<JobId> {
        self.inner.steal()
    }

    pub fn len(&self) -> usize { self.inner.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(all(test, not(loom)))]
fn ids(range: std::ops::Range<u64>) -> impl Iterator<Item = JobId> {
    range.map(JobId::from_bits)
}

#[cfg(not(loom))]
#[test]
fn test_owner_is_lifo_thief_is_fifo() {
    let queue = WorkStealingQueue::with_capacity(8);
    let stealer = queue.stealer();

    for id in ids(0..5) {
        queue.push(id);
    }
    assert_eq!(queue.len(), 5);

    assert_eq!(queue.pop(), Some(JobId::from_bits(4)));
    assert_eq!(stealer.steal(), Some(JobId::from_bits(0)));
    assert_eq!(stealer.steal(), Some(JobId::from_bits(1)));
    assert_eq!(queue.pop(), Some(JobId::from_bits(3)));
    assert_eq!(queue.pop(), Some(JobId::from_bits(2)));
    assert_eq!(queue.pop(), None);
    assert_eq!(stealer.steal(), None);
    assert!(queue.is_empty());

    // The indices keep moving forward and wrap around the ring.
    for round in 0..10u64 {
        for id in ids(round * 8..round * 8 + 8) {
            queue.push(id);
        }
        for id in ids(round * 8..round * 8 + 8) {
            assert_eq!(stealer.steal(), Some(id));
        }
    }
}

#[cfg(not(loom))]
#[test]
#[should_panic(expected = "job queue overflow")]
fn test_overflow() {
    let queue = WorkStealingQueue::with_capacity(4);
    for id in ids(0..5) {
        queue.push(id);
    }
}

#[cfg(not(loom))]
#[test]
fn test_concurrent_pop_and_steal_claims_each_job_once() {
    use std::sync::atomic::AtomicBool;
    use std::thread;

    const NUM_JOBS: u64 = 10_000;
    const NUM_THIEVES: usize = 3;

    for _ in 0..20 {
        let queue = WorkStealingQueue::with_capacity(NUM_JOBS as usize);
        let claimed: std::sync::Arc<Vec<std::sync::atomic::AtomicU32>> = std::sync::Arc::new(
            (0..NUM_JOBS).map(|_| std::sync::atomic::AtomicU32::new(0)).collect()
        );
        let done = std::sync::Arc::new(AtomicBool::new(false));

        let thieves: Vec<_> = (0..NUM_THIEVES).map(|_| {
            let stealer = queue.stealer();
            let claimed = claimed.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut count = 0;
                loop {
                    match stealer.steal() {
                        Some(id) => {
                            claimed[id.to_bits() as usize].fetch_add(1, Ordering::Relaxed);
                            count += 1;
                        }
                        None => {
                            if done.load(Ordering::Acquire) && stealer.is_empty() {
                                break;
                            }
                        }
                    }
                }
                count
            })
        }).collect();

        // Interleave pushes and pops so that the owner regularly races the
        // thieves for the last element.
        let mut popped = 0;
        for id in ids(0..NUM_JOBS) {
            queue.push(id);
            if id.to_bits() % 3 == 0 {
                if let Some(id) = queue.pop() {
                    claimed[id.to_bits() as usize].fetch_add(1, Ordering::Relaxed);
                    popped += 1;
                }
            }
        }
        while let Some(id) = queue.pop() {
            claimed[id.to_bits() as usize].fetch_add(1, Ordering::Relaxed);
            popped += 1;
        }
        done.store(true, Ordering::Release);

        let stolen: usize = thieves.into_iter().map(|t| t.join().unwrap()).sum();

        assert_eq!(popped + stolen, NUM_JOBS as usize);
        for count in claimed.iter() {
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }
    }
}

#[cfg(loom)]
#[test]
fn test_loom_last_element_race() {
    loom::model(|| {
        let queue = WorkStealingQueue::with_capacity(2);
        let stealer = queue.stealer();
        queue.push(JobId::from_bits(7));

        let thief = loom::thread::spawn(move || stealer.steal());

        let popped = queue.pop();
        let stolen = thief.join().unwrap();

        assert!(popped.is_some() ^ stolen.is_some());
    });
}
