//! One-shot timer backing [`CancelToken`](super::cancel::CancelToken) deadlines.
//!
//! Each timer parks a dedicated thread on a condvar until either the deadline
//! passes or [`Timer::stop`] is called, whichever happens first.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Fired,
    Stopped,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<TimerState>,
    notify: Condvar,
}

#[derive(Debug, Clone)]
pub(crate) struct Timer(Arc<Shared>);

impl Timer {
    /// Calls `f` on the timer thread once `d` has elapsed, unless stopped first.
    pub(crate) fn after<F>(d: Duration, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        // None: too far out to represent, only stop() ends the wait
        let deadline = Instant::now().checked_add(d);
        let timer = Self(Arc::new(Shared {
            state: Mutex::new(TimerState::Pending),
            notify: Condvar::new(),
        }));
        let shared = timer.0.clone();
        thread::Builder::new()
            .name("lockgroup-timer".to_string())
            .spawn(move || {
                let mut state = shared.state.lock();
                while *state == TimerState::Pending {
                    match deadline {
                        Some(deadline) => {
                            if shared.notify.wait_until(&mut state, deadline).timed_out() {
                                break;
                            }
                        }
                        None => shared.notify.wait(&mut state),
                    }
                }
                if *state != TimerState::Pending {
                    return;
                }
                *state = TimerState::Fired;
                drop(state);
                log::trace!("timer fired after {d:?}");
                f();
            })?;
        Ok(timer)
    }

    /// Prevents the timer from firing.
    /// Returns false if it already fired or was already stopped.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.0.state.lock();
        if *state != TimerState::Pending {
            return false;
        }
        *state = TimerState::Stopped;
        self.0.notify.notify_one();
        log::trace!("timer stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::sync::timer::Timer;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn fires_after_duration() {
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        let _timer = Timer::after(Duration::from_millis(50), move || tx.send(()).unwrap()).unwrap();
        rx.recv().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn stop_prevents_firing() {
        let (tx, rx) = mpsc::channel::<()>();
        let timer = Timer::after(Duration::from_millis(50), move || tx.send(()).unwrap()).unwrap();
        assert!(timer.stop());
        assert!(!timer.stop());
        // Sender is dropped with the closure once the thread exits
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn stop_after_fire() {
        let (tx, rx) = mpsc::channel();
        let timer = Timer::after(Duration::ZERO, move || tx.send(()).unwrap()).unwrap();
        rx.recv().unwrap();
        assert!(!timer.stop());
    }

    #[test]
    fn unrepresentable_deadline_waits_for_stop() {
        let (tx, rx) = mpsc::channel::<()>();
        let timer = Timer::after(Duration::MAX, move || tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(timer.stop());
    }
}
