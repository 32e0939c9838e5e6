use std::collections::VecDeque;

use super::sync::Mutex;
use super::job::JobId;

/// A mutex-guarded double ended queue with the same contract as the lock-free
/// `WorkStealingQueue`: `pop` takes the newest job, `steal` takes the oldest.
///
/// Any thread may call any method. The lock is only held for the duration of
/// the queue operation itself, never while running a job.
pub struct LockingQueue {
    jobs: Mutex<VecDeque<JobId>>,
    capacity: usize,
}

impl LockingQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        LockingQueue {
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn push(&self, job: JobId) {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.len() >= self.capacity {
            // Release the lock before panicking so the other users of the
            // queue don't see it poisoned.
            drop(jobs);
            panic!("job queue overflow: capacity of {} jobs exceeded", self.capacity);
        }

        jobs.push_back(job);
    }

    pub fn pop(&self) -> Option<JobId> {
        self.jobs.lock().unwrap().pop_back()
    }

    pub fn steal(&self) -> Option<JobId> {
        self.jobs.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[test]
fn test_pop_is_lifo_steal_is_fifo() {
    let queue = LockingQueue::with_capacity(8);
    for i in 0..5 {
        queue.push(JobId::from_bits(i));
    }

    assert_eq!(queue.pop(), Some(JobId::from_bits(4)));
    assert_eq!(queue.steal(), Some(JobId::from_bits(0)));
    assert_eq!(queue.steal(), Some(JobId::from_bits(1)));
    assert_eq!(queue.pop(), Some(JobId::from_bits(3)));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.pop(), Some(JobId::from_bits(2)));
    assert_eq!(queue.pop(), None);
    assert_eq!(queue.steal(), None);
}

#[test]
#[should_panic(expected = "job queue overflow")]
fn test_overflow() {
    let queue = LockingQueue::with_capacity(2);
    for i in 0..3 {
        queue.push(JobId::from_bits(i));
    }
}

#[test]
fn test_concurrent_pop_and_steal_claims_each_job_once() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NUM_JOBS: u64 = 1000;

    let queue = Arc::new(LockingQueue::with_capacity(NUM_JOBS as usize));
    for i in 0..NUM_JOBS {
        queue.push(JobId::from_bits(i));
    }

    let claimed: Arc<Vec<AtomicU32>> = Arc::new((0..NUM_JOBS).map(|_| AtomicU32::new(0)).collect());

    let threads: Vec<_> = (0..4).map(|i| {
        let queue = queue.clone();
        let claimed = claimed.clone();
        std::thread::spawn(move || {
            let mut count = 0;
            loop {
                let job = if i == 0 { queue.pop() } else { queue.steal() };
                match job {
                    Some(id) => {
                        claimed[id.to_bits() as usize].fetch_add(1, Ordering::Relaxed);
                        count += 1;
                    }
                    None => break,
                }
            }
            count
        })
    }).collect();

    let total: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
    assert_eq!(total, NUM_JOBS as usize);
    for count in claimed.iter() {
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
