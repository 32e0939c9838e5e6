use super::sync::Arc;
use super::deque::{WorkStealingQueue, Stealer};
use super::locking_queue::LockingQueue;
use super::job::JobId;

/// Which queue implementation backs the worker-local queues.
///
/// Both have the same contract. The lock-free deque is the default, the
/// locking one is a portable fallback for targets where the lock-free one
/// can't be trusted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueBackend {
    LockFree,
    Locking,
}

impl Default for QueueBackend {
    fn default() -> Self { QueueBackend::LockFree }
}

/// The end of a worker queue that only its worker thread uses.
pub(crate) enum LocalQueue {
    LockFree(WorkStealingQueue),
    Locking(Arc<LockingQueue>),
}

/// The end of a worker queue that other threads steal from.
pub(crate) enum RemoteQueue {
    LockFree(Stealer),
    Locking(Arc<LockingQueue>),
}

pub(crate) fn worker_queue(backend: QueueBackend, capacity: usize) -> (LocalQueue, RemoteQueue) {
    match backend {
        QueueBackend::LockFree => {
            let queue = WorkStealingQueue::with_capacity(capacity);
            let stealer = queue.stealer();
            (LocalQueue::LockFree(queue), RemoteQueue::LockFree(stealer))
        }
        QueueBackend::Locking => {
            let queue = Arc::new(LockingQueue::with_capacity(capacity));
            (LocalQueue::Locking(queue.clone()), RemoteQueue::Locking(queue))
        }
    }
}

impl LocalQueue {
    #[inline]
    pub fn push(&self, job: JobId) {
        match self {
            LocalQueue::LockFree(queue) => queue.push(job),
            LocalQueue::Locking(queue) => queue.push(job),
        }
    }

    #[inline]
    pub fn pop(&self) -> Option<JobId> {
        match self {
            LocalQueue::LockFree(queue) => queue.pop(),
            LocalQueue::Locking(queue) => queue.pop(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            LocalQueue::LockFree(queue) => queue.is_empty(),
            LocalQueue::Locking(queue) => queue.is_empty(),
        }
    }
}

impl RemoteQueue {
    #[inline]
    pub fn steal(&self) -> Option<JobId> {
        match self {
            RemoteQueue::LockFree(stealer) => stealer.steal(),
            RemoteQueue::Locking(queue) => queue.steal(),
        }
    }
}

#[test]
fn test_backends_behave_the_same() {
    for backend in [QueueBackend::LockFree, QueueBackend::Locking] {
        let (local, remote) = worker_queue(backend, 16);
        let mut log = Vec::new();

        for i in 0..6 {
            local.push(JobId::from_bits(i));
        }
        log.push(local.pop());
        log.push(remote.steal());
        log.push(local.pop());
        log.push(remote.steal());
        log.push(local.pop());
        log.push(local.pop());
        log.push(local.pop());
        log.push(remote.steal());

        assert!(local.is_empty(), "{:?}", backend);
        assert_eq!(
            log,
            [Some(5), Some(0), Some(4), Some(1), Some(3), Some(2), None, None]
                .iter()
                .map(|id| id.map(JobId::from_bits))
                .collect::<Vec<_>>(),
            "{:?}", backend,
        );
    }
}
