//! Job groups track how many jobs of a batch are still outstanding, so that a
//! caller can wait for a set of unrelated top level jobs at once.

use super::sync::{Ordering, AtomicBool, AtomicI32, Mutex, Condvar};

/// Handle to a slot of the job group table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobGroupId(pub(crate) u32);

pub const INVALID_JOB_GROUP_ID: JobGroupId = JobGroupId(u32::MAX);

impl JobGroupId {
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != INVALID_JOB_GROUP_ID
    }
}

struct GroupSlot {
    in_use: AtomicBool,
    unfinished: AtomicI32,
    // For waiters that ran out of jobs to help with.
    mutex: Mutex<()>,
    cond: Condvar,
}

pub(crate) struct JobGroupTable {
    slots: Box<[GroupSlot]>,
}

impl JobGroupTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| GroupSlot {
                in_use: AtomicBool::new(false),
                unfinished: AtomicI32::new(0),
                mutex: Mutex::new(()),
                cond: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        JobGroupTable { slots }
    }

    pub fn capacity(&self) -> usize { self.slots.len() }

    pub fn allocate(&self) -> JobGroupId {
        for (idx, slot) in self.slots.iter().enumerate() {
            let claimed = slot.in_use
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok();

            if claimed {
                debug_assert_eq!(slot.unfinished.load(Ordering::Relaxed), 0);
                return JobGroupId(idx as u32);
            }
        }

        panic!("job group table exhausted: all {} groups are in use", self.slots.len());
    }

    fn slot(&self, group: JobGroupId) -> &GroupSlot {
        assert!(group.is_valid(), "invalid job group id");
        let slot = &self.slots[group.0 as usize];
        assert!(slot.in_use.load(Ordering::Acquire), "job group {:?} is not allocated", group);

        slot
    }

    /// Called when a job joins the group.
    pub fn add_job(&self, group: JobGroupId) {
        self.slot(group).unfinished.fetch_add(1, Ordering::AcqRel);
    }

    /// Called when a job of the group retires.
    pub fn finish_job(&self, group: JobGroupId) {
        let slot = &self.slots[group.0 as usize];
        let remaining = slot.unfinished.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(remaining >= 0, "job group {:?} finished more jobs than it had", group);

        if remaining == 0 {
            // Taking the lock orders the notification after a waiter's check.
            drop(slot.mutex.lock().unwrap());
            slot.cond.notify_all();
        }
    }

    pub fn is_complete(&self, group: JobGroupId) -> bool {
        self.slot(group).unfinished.load(Ordering::Acquire) == 0
    }

    /// Block the current thread until the group has no outstanding job.
    pub fn block_until_complete(&self, group: JobGroupId) {
        let slot = self.slot(group);
        let mut guard = slot.mutex.lock().unwrap();
        while slot.unfinished.load(Ordering::Acquire) > 0 {
            guard = slot.cond.wait(guard).unwrap();
        }
    }

    /// Return the slot to the table once its waiter has observed completion.
    pub fn release(&self, group: JobGroupId) {
        let slot = self.slot(group);
        assert_eq!(
            slot.unfinished.load(Ordering::Acquire), 0,
            "releasing job group {:?} with outstanding jobs", group,
        );
        slot.in_use.store(false, Ordering::Release);
    }
}

#[test]
fn test_group_lifecycle() {
    let table = JobGroupTable::new(2);

    let a = table.allocate();
    let b = table.allocate();
    assert_ne!(a, b);

    table.add_job(a);
    table.add_job(a);
    assert!(!table.is_complete(a));
    assert!(table.is_complete(b));

    table.finish_job(a);
    assert!(!table.is_complete(a));
    table.finish_job(a);
    assert!(table.is_complete(a));

    table.release(a);
    let c = table.allocate();
    assert_eq!(a, c);
}

#[test]
fn test_block_until_complete() {
    use std::sync::Arc;

    let table = Arc::new(JobGroupTable::new(1));
    let group = table.allocate();
    for _ in 0..16 {
        table.add_job(group);
    }

    let finisher = {
        let table = table.clone();
        std::thread::spawn(move || {
            for _ in 0..16 {
                table.finish_job(group);
            }
        })
    };

    table.block_until_complete(group);
    assert!(table.is_complete(group));
    finisher.join().unwrap();
    table.release(group);
}

#[test]
#[should_panic(expected = "job group table exhausted")]
fn test_group_table_exhaustion() {
    let table = JobGroupTable::new(3);
    for _ in 0..4 {
        table.allocate();
    }
}
