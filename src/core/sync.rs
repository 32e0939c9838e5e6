pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::sync::{
    Arc, Mutex, Condvar,
    atomic::{fence, AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicBool},
};


#[cfg(loom)] pub use loom::sync::{
    Arc, Mutex, Condvar,
    atomic::{fence, AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicBool},
};

// Worker threads are always spawned through std: loom does not model
// `thread::Builder` and the scheduler as a whole is not run under loom.
pub use std::thread;
