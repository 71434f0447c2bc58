use super::{cancel::CancellationSource, error::Error};
use parking_lot::{Condvar, Mutex};
use std::sync::{
    mpsc::{self, RecvTimeoutError},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

/// Sleeps like [`std::thread::sleep`], but returns early with the source's cause
/// if `source` becomes done before `d` elapses.
///
/// Returns the cause immediately if `source` is already done. The wait itself runs
/// on the calling thread; the source's callback is the only other party.
pub fn sleep<S>(source: &S, d: Duration) -> Result<(), Error>
where
    S: CancellationSource + ?Sized,
{
    if let Some(cause) = source.cause() {
        return Err(cause);
    }
    let start = Instant::now();
    // One slot: the callback never blocks, even once nobody is receiving
    let (tx, rx) = mpsc::sync_channel(1);
    let registration = source.on_done(Box::new(move |cause| {
        let _ = tx.try_send(cause);
    }));
    match rx.recv_timeout(d) {
        Ok(cause) => {
            log::trace!("sleep {d:?} canceled: {cause}");
            Err(cause)
        }
        Err(RecvTimeoutError::Timeout) => {
            source.forget(registration);
            log::trace!("sleep {d:?} timed out");
            Ok(())
        }
        // The source dropped the callback unrun, only the deadline is left
        Err(RecvTimeoutError::Disconnected) => {
            thread::sleep(d.saturating_sub(start.elapsed()));
            log::trace!("sleep {d:?} timed out");
            Ok(())
        }
    }
}

/// Same contract as [`sleep`], waiting on a condvar instead of a channel.
pub fn sleep_condvar<S>(source: &S, d: Duration) -> Result<(), Error>
where
    S: CancellationSource + ?Sized,
{
    if let Some(cause) = source.cause() {
        return Err(cause);
    }
    // None: too far out to represent, only the source ends the wait
    let deadline = Instant::now().checked_add(d);
    let shared = Arc::new((Mutex::new(None::<Error>), Condvar::new()));
    let registration = source.on_done(Box::new({
        let shared = shared.clone();
        move |cause| {
            let (canceled, cond) = &*shared;
            *canceled.lock() = Some(cause);
            cond.notify_one();
        }
    }));

    let (canceled, cond) = &*shared;
    let mut canceled = canceled.lock();
    loop {
        if let Some(cause) = canceled.take() {
            return Err(cause);
        }
        match deadline {
            Some(deadline) => {
                if cond.wait_until(&mut canceled, deadline).timed_out() {
                    break;
                }
            }
            None => cond.wait(&mut canceled),
        }
    }
    drop(canceled);
    source.forget(registration);
    Ok(())
}
