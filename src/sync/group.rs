//! Mutexes that can be locked together, atomically, and canceled together.
//!
//! A [`MutexGroup`] owns one internal lock and condvar shared by every
//! [`GroupMutex`] it creates. Each mutex is just a `held` flag inside the group's
//! state, so [`MutexGroup::lock_all`] can check that every requested mutex is free
//! and mark them all held in a single critical section. A caller that needs two
//! mutexes therefore either gets both or waits holding neither, which rules out
//! the circular wait behind the dining philosophers deadlock.
//!
//! Waiting is a broadcast-and-recheck loop: every state change wakes every waiter.
//! There is no fairness between waiters.

use super::{cancel::CancellationSource, error::Error};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    // The cause once canceled; never cleared or replaced
    canceled: Option<Error>,
    // Indexed by GroupMutex::slot
    held: Vec<bool>,
    free: Vec<usize>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    // Deregisters from the bound source, if any
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.get_mut().take() {
            detach();
        }
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("state", &self.state)
            .field("bound", &self.detach.lock().is_some())
            .finish()
    }
}

impl Inner {
    fn cancel(&self, cause: Error) {
        let mut state = self.state.lock();
        if state.canceled.is_some() {
            return;
        }
        log::debug!("mutex group canceled: {cause}");
        state.canceled = Some(cause);
        self.cond.notify_all();
    }

    /// Waits until none of `slots` is held, returning the locked state so the
    /// caller can claim them before anyone else looks.
    fn wait_free(&self, slots: &[usize]) -> Result<MutexGuard<'_, State>, Error> {
        let mut state = self.state.lock();
        loop {
            if let Some(cause) = &state.canceled {
                return Err(cause.clone());
            }
            if !slots.iter().any(|&slot| state.held[slot]) {
                return Ok(state);
            }
            self.cond.wait(&mut state);
        }
    }
}

/// Atomic locking and cancellation for a group of [`GroupMutex`]es.
/// See [`MutexGroup::lock_all`].
#[derive(Debug, Default)]
pub struct MutexGroup {
    inner: Arc<Inner>,
}

impl MutexGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a group that is canceled with `source`'s cause once `source` is done.
    ///
    /// The group keeps a clone of `source` and withdraws its callback once the group
    /// and all of its mutexes are dropped.
    pub fn with_source<S>(source: &S) -> Self
    where
        S: CancellationSource + Clone + Send + 'static,
    {
        let group = Self::new();
        let weak = Arc::downgrade(&group.inner);
        let registration = source.on_done(Box::new(move |cause| {
            if let Some(inner) = weak.upgrade() {
                inner.cancel(cause);
            }
        }));
        let source = source.clone();
        *group.inner.detach.lock() = Some(Box::new(move || {
            source.forget(registration);
        }));
        group
    }

    pub fn new_mutex(&self) -> GroupMutex {
        let mut state = self.inner.state.lock();
        let slot = match state.free.pop() {
            Some(slot) => slot,
            None => {
                state.held.push(false);
                state.held.len() - 1
            }
        };
        GroupMutex {
            group: self.inner.clone(),
            slot,
        }
    }

    /// Cancels the group with cause [`Error::GroupCanceled`].
    ///
    /// Every blocked and future `lock`, `unlock` and `lock_all` returns the cause.
    /// Does not wait for blocked callers to return. Only the first cancellation of a
    /// group has any effect, whichever way it came.
    pub fn cancel(&self) {
        self.inner.cancel(Error::GroupCanceled);
    }

    pub fn cause(&self) -> Option<Error> {
        self.inner.state.lock().canceled.clone()
    }

    /// Atomically locks every mutex in `mutexes`.
    ///
    /// If any of them is held, blocks until all of them are free at the same time;
    /// none of them is taken in the meantime. Returns the cause if the group is or
    /// becomes canceled.
    ///
    /// # Panics
    ///
    /// If `mutexes` is empty or contains a mutex created by another group.
    pub fn lock_all(&self, mutexes: &[&GroupMutex]) -> Result<(), Error> {
        if mutexes.is_empty() {
            panic!("no mutex to lock");
        }
        if mutexes.iter().any(|m| !Arc::ptr_eq(&m.group, &self.inner)) {
            panic!("mutex not created by this group");
        }
        let slots = mutexes.iter().map(|m| m.slot).collect::<Vec<_>>();
        let mut state = self.inner.wait_free(&slots)?;
        for slot in slots {
            state.held[slot] = true;
        }
        Ok(())
    }
}

/// A mutual exclusion lock that belongs to a [`MutexGroup`].
///
/// Locks like a plain mutex, can be taken together with its siblings through
/// [`MutexGroup::lock_all`], and fails with the group's cause once the group is
/// canceled. Not `Clone`: the handle is the lock.
#[derive(Debug)]
pub struct GroupMutex {
    group: Arc<Inner>,
    slot: usize,
}

impl GroupMutex {
    /// Blocks until the mutex is free, then locks it.
    /// Returns the group's cause if it is or becomes canceled.
    pub fn lock(&self) -> Result<(), Error> {
        let mut state = self.group.wait_free(&[self.slot])?;
        state.held[self.slot] = true;
        self.group.cond.notify_all();
        Ok(())
    }

    /// Unlocks the mutex. Returns the group's cause if it is canceled, whether or
    /// not the mutex is held.
    ///
    /// # Panics
    ///
    /// If the group is not canceled and the mutex is not locked.
    pub fn unlock(&self) -> Result<(), Error> {
        let mut state = self.group.state.lock();
        if let Some(cause) = &state.canceled {
            return Err(cause.clone());
        }
        if !state.held[self.slot] {
            panic!("mutex not locked");
        }
        state.held[self.slot] = false;
        self.group.cond.notify_all();
        Ok(())
    }
}

// Dropping a held mutex releases it
impl Drop for GroupMutex {
    fn drop(&mut self) {
        let mut state = self.group.state.lock();
        if std::mem::replace(&mut state.held[self.slot], false) {
            self.group.cond.notify_all();
        }
        state.free.push(self.slot);
    }
}
