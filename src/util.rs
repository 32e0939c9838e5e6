use crate::core::sync::{AtomicBool, Ordering};

/// A simple utility to dynamically assert that a section of code is only
/// entered by a single thread at a time, and never re-entered.
///
/// The scheduler uses it to catch overlapping main thread drains.
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    pub fn begin(&self) {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (begin): {:?} is already running", self.tag);
    }

    pub fn end(&self) {
        let res = self.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (end): {:?}", self.tag);
    }
}

#[test]
fn exclu_check_01() {
    let lock = ExclusiveCheck::with_tag("section");

    for _ in 0..3 {
        lock.begin();
        lock.end();
    }
}

#[test]
#[should_panic(expected = "already running")]
fn exclu_check_02() {
    let lock = ExclusiveCheck::with_tag("section");

    lock.begin();
    lock.begin();
}
