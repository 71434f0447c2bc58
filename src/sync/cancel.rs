//! Cancellation sources.
//!
//! [`CancellationSource`] is the only thing [`MutexGroup`](super::group::MutexGroup)
//! and [`sleep`](super::sleep::sleep) need from whatever decides that work should
//! stop: whether it is done, why, and a one-shot callback for when it becomes done.
//! [`CancelToken`] is the implementation shipped with this crate.

use super::{error::Error, timer::Timer};
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub type DoneCallback = Box<dyn FnOnce(Error) + Send + 'static>;

/// Handle to a callback registered with [`CancellationSource::on_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(u64);

impl Registration {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
    pub const fn id(self) -> u64 {
        self.0
    }
}

pub trait CancellationSource {
    /// Why the source is done, or `None` while it is still active.
    fn cause(&self) -> Option<Error>;

    fn is_done(&self) -> bool {
        self.cause().is_some()
    }

    /// Registers `f` to be called once, with the cause, when the source becomes done.
    ///
    /// Implementations must call `f` right away (on the calling thread) if the source
    /// is already done, so a registration can never miss the transition. Callbacks
    /// may call [`forget`](Self::forget), so they must not run under a lock it takes.
    fn on_done(&self, f: DoneCallback) -> Registration;

    /// Drops a callback that has not run yet. Returns true if it was removed.
    fn forget(&self, registration: Registration) -> bool {
        let _ = registration;
        false
    }
}

impl<S: CancellationSource + ?Sized> CancellationSource for &S {
    fn cause(&self) -> Option<Error> {
        (**self).cause()
    }
    fn is_done(&self) -> bool {
        (**self).is_done()
    }
    fn on_done(&self, f: DoneCallback) -> Registration {
        (**self).on_done(f)
    }
    fn forget(&self, registration: Registration) -> bool {
        (**self).forget(registration)
    }
}

impl<S: CancellationSource + ?Sized> CancellationSource for Arc<S> {
    fn cause(&self) -> Option<Error> {
        (**self).cause()
    }
    fn is_done(&self) -> bool {
        (**self).is_done()
    }
    fn on_done(&self, f: DoneCallback) -> Registration {
        (**self).on_done(f)
    }
    fn forget(&self, registration: Registration) -> bool {
        (**self).forget(registration)
    }
}

#[derive(Default)]
struct TokenState {
    cause: Option<Error>,
    next_id: u64,
    callbacks: Vec<(u64, DoneCallback)>,
    links: Links,
}

/// What a derived token holds on to: its registration with the parent and its
/// deadline timer. Released once the token is done or its last clone is dropped.
#[derive(Default)]
struct Links {
    parent: Option<(Weak<Mutex<TokenState>>, Registration)>,
    timer: Option<Timer>,
}

impl Drop for Links {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        if let Some((parent, registration)) = self.parent.take() {
            if let Some(parent) = CancelToken::from_weak(&parent) {
                parent.forget(registration);
            }
        }
    }
}

/// A cancellation source that is done once [`cancel`](Self::cancel)led, once its
/// parent is done, or once its deadline passes.
///
/// Clones share the same state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Mutex<TokenState>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_weak(weak: &Weak<Mutex<TokenState>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Cancels with [`Error::Canceled`].
    pub fn cancel(&self) {
        self.cancel_with(Error::Canceled);
    }

    /// Records `cause` and runs every registered callback with it.
    /// Only the first call has any effect; returns whether this call was it.
    pub fn cancel_with(&self, cause: Error) -> bool {
        let (callbacks, links) = {
            let mut state = self.inner.lock();
            if state.cause.is_some() {
                return false;
            }
            state.cause = Some(cause.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.links),
            )
        };
        log::debug!("cancel token done: {cause}");
        // Outside the lock: callbacks and links may call back into this token
        drop(links);
        for (_, f) in callbacks {
            f(cause.clone());
        }
        true
    }

    /// A token that is canceled with this token's cause when this token is done,
    /// and can also be canceled on its own without affecting this one.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak_child = Arc::downgrade(&child.inner);
        let registration = self.on_done(Box::new(move |cause| {
            if let Some(child) = Self::from_weak(&weak_child) {
                child.cancel_with(cause);
            }
        }));
        let mut state = child.inner.lock();
        if state.cause.is_none() {
            state.links.parent = Some((Arc::downgrade(&self.inner), registration));
        }
        drop(state);
        child
    }

    /// A child token that is additionally canceled with [`Error::DeadlineExceeded`]
    /// once `timeout` has elapsed.
    ///
    /// Fails only if the timer thread cannot be spawned.
    pub fn with_timeout(&self, timeout: Duration) -> io::Result<Self> {
        let child = self.child();
        if timeout.is_zero() {
            child.cancel_with(Error::DeadlineExceeded);
            return Ok(child);
        }
        let weak_child = Arc::downgrade(&child.inner);
        let timer = Timer::after(timeout, move || {
            if let Some(child) = Self::from_weak(&weak_child) {
                child.cancel_with(Error::DeadlineExceeded);
            }
        })?;
        let mut state = child.inner.lock();
        if state.cause.is_none() {
            state.links.timer = Some(timer);
            drop(state);
        } else {
            drop(state);
            timer.stop();
        }
        Ok(child)
    }

    pub fn with_deadline(&self, deadline: Instant) -> io::Result<Self> {
        self.with_timeout(deadline.saturating_duration_since(Instant::now()))
    }
}

impl CancellationSource for CancelToken {
    fn cause(&self) -> Option<Error> {
        self.inner.lock().cause.clone()
    }

    fn on_done(&self, f: DoneCallback) -> Registration {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        match state.cause.clone() {
            Some(cause) => {
                drop(state);
                f(cause);
            }
            None => state.callbacks.push((id, f)),
        }
        Registration::new(id)
    }

    fn forget(&self, registration: Registration) -> bool {
        let mut state = self.inner.lock();
        match state
            .callbacks
            .iter()
            .position(|(id, _)| *id == registration.id())
        {
            Some(i) => {
                drop(state.callbacks.swap_remove(i));
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CancelToken")
            .field("cause", &state.cause)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::sync::{
        cancel::{CancelToken, CancellationSource},
        error::Error,
    };
    use std::io;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    };
    use std::time::{Duration, Instant};

    #[test]
    fn first_cause_wins() {
        let token = CancelToken::new();
        assert!(!token.is_done());
        assert_eq!(token.cause(), None);
        assert!(token.cancel_with(Error::DeadlineExceeded));
        assert!(!token.cancel_with(Error::Canceled));
        token.cancel();
        assert_eq!(token.cause(), Some(Error::DeadlineExceeded));
    }

    #[test]
    fn callbacks_run_once() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            token.on_done(Box::new(move |cause| {
                assert_eq!(cause, Error::Canceled);
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        token.cancel();
        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn on_done_after_done_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let (tx, rx) = mpsc::channel();
        token.on_done(Box::new(move |cause| tx.send(cause).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), Error::Canceled);
    }

    #[test]
    fn forget_skips_callback() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let registration = token.on_done(Box::new({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert!(token.forget(registration));
        assert!(!token.forget(registration));
        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_cancel_records_one_cause() {
        let token = CancelToken::new();
        let causes = (0..8)
            .map(|i| Error::other(io::Error::other(format!("{i}"))))
            .collect::<Vec<_>>();
        let wins = std::thread::scope(|s| {
            let ths = causes
                .iter()
                .map(|cause| s.spawn(|| token.cancel_with(cause.clone())))
                .collect::<Vec<_>>();
            ths.into_iter()
                .map(|th| th.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
        let cause = token.cause().unwrap();
        assert!(causes.contains(&cause));
    }

    #[test]
    fn child_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();
        sibling.cancel();
        assert!(!parent.is_done());
        assert!(!child.is_done());

        parent.cancel_with(Error::GroupCanceled);
        assert_eq!(child.cause(), Some(Error::GroupCanceled));
    }

    #[test]
    fn child_of_done_parent_is_done() {
        let parent = CancelToken::new();
        parent.cancel();
        assert_eq!(parent.child().cause(), Some(Error::Canceled));
        assert_eq!(
            parent.with_timeout(Duration::from_secs(60)).unwrap().cause(),
            Some(Error::Canceled)
        );
    }

    #[test]
    fn finished_child_deregisters_from_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert_eq!(parent.inner.lock().callbacks.len(), 1);
        child.cancel();
        assert_eq!(parent.inner.lock().callbacks.len(), 0);
    }

    #[test]
    fn zero_timeout_is_done_on_return() {
        let token = CancelToken::new().with_timeout(Duration::ZERO).unwrap();
        assert_eq!(token.cause(), Some(Error::DeadlineExceeded));
        let past = Instant::now() - Duration::from_millis(1);
        let token = CancelToken::new().with_deadline(past).unwrap();
        assert_eq!(token.cause(), Some(Error::DeadlineExceeded));
    }

    #[test]
    fn timeout_fires() {
        let token = CancelToken::new().with_timeout(Duration::from_millis(30)).unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        token.on_done(Box::new(move |cause| tx.send(cause).unwrap()));
        assert_eq!(rx.recv().unwrap(), Error::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn cancel_before_timeout() {
        let token = CancelToken::new().with_timeout(Duration::from_secs(60)).unwrap();
        let timer = token.inner.lock().links.timer.clone().unwrap();
        token.cancel();
        assert_eq!(token.cause(), Some(Error::Canceled));
        // Already stopped by the cancel
        assert!(!timer.stop());
    }

    #[test]
    fn dropped_child_deregisters_from_parent() {
        let parent = CancelToken::new();
        for _ in 0..100 {
            drop(parent.child());
        }
        assert_eq!(parent.inner.lock().callbacks.len(), 0);

        let child = parent.child();
        let clone = child.clone();
        drop(child);
        // A live clone keeps the registration
        assert_eq!(parent.inner.lock().callbacks.len(), 1);
        drop(clone);
        assert_eq!(parent.inner.lock().callbacks.len(), 0);
    }

    #[test]
    fn dropped_timeout_token_stops_timer() {
        let parent = CancelToken::new();
        let timers = (0..50)
            .map(|_| {
                let token = parent.with_timeout(Duration::from_secs(3600)).unwrap();
                let timer = token.inner.lock().links.timer.clone().unwrap();
                timer
            })
            .collect::<Vec<_>>();
        assert_eq!(parent.inner.lock().callbacks.len(), 0);
        assert!(timers.iter().all(|timer| !timer.stop()));

        let token = parent.with_timeout(Duration::MAX).unwrap();
        let timer = token.inner.lock().links.timer.clone().unwrap();
        drop(token);
        assert!(!timer.stop());
    }

    #[test]
    fn dropped_parent_leaves_child_usable() {
        let parent = CancelToken::new();
        let child = parent.child();
        drop(parent);
        assert!(!child.is_done());
        child.cancel();
        assert_eq!(child.cause(), Some(Error::Canceled));
    }
}
