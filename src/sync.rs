// loom/std switch for every synchronization primitive in the crate.
//
// Pool mutexes, handle counts and gauges must all come from here: one direct
// `std::sync` import would hide that operation from loom's scheduler.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicUsize, Ordering, fence};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering, fence};
}

// ---------------------------------------------------------------------------
// sync (Mutex, MutexGuard, Arc, RwLock)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, MutexGuard, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard, RwLock};

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::spawn;

    #[cfg(not(loom))]
    pub(crate) use std::thread::spawn;
}

// ---------------------------------------------------------------------------
// Barrier: loom has none, so loom builds get a spinning countdown over loom
// atomics. Ordinary tests use std::sync::Barrier.
// ---------------------------------------------------------------------------
pub(crate) mod barrier {
    #[cfg(not(loom))]
    pub(crate) use std::sync::Barrier;

    #[cfg(loom)]
    #[allow(dead_code)]
    pub(crate) struct Barrier {
        total: usize,
        arrived: super::atomic::AtomicUsize,
    }

    #[cfg(loom)]
    #[allow(dead_code)]
    impl Barrier {
        pub(crate) fn new(n: usize) -> Self {
            Self {
                total: n,
                arrived: super::atomic::AtomicUsize::new(0),
            }
        }

        pub(crate) fn wait(&self) {
            use super::atomic::Ordering;
            if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 < self.total {
                while self.arrived.load(Ordering::Acquire) < self.total {
                    loom::thread::yield_now();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OnceLock: the global router lives in a `static`, and loom offers neither
// OnceLock nor a const Mutex. Under loom the slot is guarded by a plain std
// Mutex; the router is built once per process, so loom has nothing to explore
// there.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    slot: std::sync::Mutex<Option<Box<T>>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Box<T>>> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &T {
        let mut slot = self.slot();
        let value: *const T = &**slot.get_or_insert_with(|| Box::new(f()));
        // Safety: the box is never replaced or dropped while &self is live.
        unsafe { &*value }
    }

    pub(crate) fn set(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(Box::new(value));
        Ok(())
    }
}

#[cfg(loom)]
// Safety: every access goes through the inner Mutex.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

// ---------------------------------------------------------------------------
// Statics. loom atomics and RwLock have no const constructors, so under loom
// these become `loom::lazy_static!` items, rebuilt for every model run.
// ---------------------------------------------------------------------------

/// `static_atomic! { pub static NAME: Type = init; }`
macro_rules! static_atomic {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;

/// `static_rwlock! { pub static NAME: RwLock<T> = init; }`
macro_rules! static_rwlock {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_rwlock;
