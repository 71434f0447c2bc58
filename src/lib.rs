//! Mutex groups: mutexes that can be locked together atomically and canceled
//! together, plus a cancellable sleep.
//!
//! ```
//! use lockgroup::{CancelToken, Error, MutexGroup};
//! use std::thread;
//!
//! let g = MutexGroup::new();
//! let (m1, m2) = (g.new_mutex(), g.new_mutex());
//! m1.lock().unwrap();
//! m2.lock().unwrap();
//! thread::scope(|s| {
//!     s.spawn(|| {
//!         m1.unlock().unwrap();
//!         m2.unlock().unwrap();
//!     });
//!     // Returns once both are free, never holding just one
//!     g.lock_all(&[&m1, &m2]).unwrap();
//! });
//!
//! let token = CancelToken::new();
//! let g = MutexGroup::with_source(&token);
//! let m = g.new_mutex();
//! token.cancel();
//! assert_eq!(m.lock(), Err(Error::Canceled));
//! ```

pub mod sync;

pub use sync::{
    cancel::{CancelToken, CancellationSource, DoneCallback, Registration},
    error::Error,
    group::{GroupMutex, MutexGroup},
    sleep::{sleep, sleep_condvar},
};
