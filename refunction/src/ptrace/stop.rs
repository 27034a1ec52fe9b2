use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use refunction_common::{
    anyhow::{bail, Result},
    nix::{sys::signal::Signal, unistd::Pid},
};

/// Why a traced thread is sitting in ptrace-stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `PTRACE_EVENT_STOP`, the whole group was stopped by `signal`.
    Group(Signal),
    /// Signal-delivery-stop, `signal` will be delivered unless suppressed.
    Signal(Signal),
}

impl StopReason {
    pub fn signal(&self) -> Signal {
        match self {
            StopReason::Group(sig) | StopReason::Signal(sig) => *sig,
        }
    }

    /// The signal to hand back to the thread when it is continued.
    ///
    /// Group-stops and our own `SIGSTOP`s are never re-delivered.
    pub fn reinject(&self) -> Option<Signal> {
        match self {
            StopReason::Signal(Signal::SIGSTOP) | StopReason::Group(_) => None,
            StopReason::Signal(sig) => Some(*sig),
        }
    }
}

#[derive(Default)]
struct Slot {
    stop: Option<StopReason>,
    /// A `SIGSTOP` was sent and a caller is waiting for it.
    requested: bool,
    /// A `SIGSTOP` was sent but the caller was served by another stop.
    stray: bool,
    closed: bool,
}

/// Single slot mailbox holding the stop token of one thread.
///
/// The token stays in place until the thread is continued so any number of
/// callers can observe the same stop.
#[derive(Default)]
pub(crate) struct StopMailbox {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl StopMailbox {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, reason: StopReason) {
        let mut slot = self.lock();
        if slot.requested {
            slot.requested = false;
            // our SIGSTOP is still queued, it must not park the thread later
            slot.stray = reason.signal() != Signal::SIGSTOP;
        }
        slot.stop = Some(reason);
        self.cond.notify_all();
    }

    pub fn peek(&self) -> Option<StopReason> {
        self.lock().stop
    }

    pub fn take(&self) -> Option<StopReason> {
        self.lock().stop.take()
    }

    /// Marks a `SIGSTOP` as in flight.
    ///
    /// Returns `true` only for the caller that has to send it.
    pub fn request_stop(&self, tid: Pid) -> Result<bool> {
        let mut slot = self.lock();
        if slot.closed {
            bail!("trace task {tid} has exited");
        }
        if slot.stop.is_some() || slot.requested {
            return Ok(false);
        }
        slot.requested = true;
        if slot.stray {
            // adopt the SIGSTOP already on its way
            slot.stray = false;
            return Ok(false);
        }
        Ok(true)
    }

    /// Consumes a stray `SIGSTOP`. Returns `false` when none was pending, in
    /// which case the `SIGSTOP` came from someone else.
    pub fn swallow_stray(&self) -> bool {
        let mut slot = self.lock();
        std::mem::take(&mut slot.stray)
    }

    pub fn has_stray(&self) -> bool {
        self.lock().stray
    }

    pub fn cancel_request(&self) {
        self.lock().requested = false;
    }

    /// Blocks until a stop token is present and returns it without consuming it.
    pub fn wait(&self, tid: Pid) -> Result<StopReason> {
        let mut slot = self.lock();
        loop {
            if let Some(reason) = slot.stop {
                return Ok(reason);
            }
            if slot.closed {
                bail!("trace task {tid} has exited");
            }
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes every waiter, the thread will never stop again.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        slot.stop = None;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_concurrent_stop_requests_send_once() {
        let mailbox = StopMailbox::default();
        let tid = Pid::from_raw(1);
        let sent = AtomicUsize::new(0);

        thread::scope(|s| {
            let waiters: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        if mailbox.request_stop(tid).unwrap() {
                            sent.fetch_add(1, Ordering::SeqCst);
                        }
                        mailbox.wait(tid).unwrap()
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(20));
            mailbox.publish(StopReason::Signal(Signal::SIGSTOP));

            for waiter in waiters {
                assert_eq!(
                    waiter.join().unwrap(),
                    StopReason::Signal(Signal::SIGSTOP)
                );
            }
        });

        assert_eq!(sent.load(Ordering::SeqCst), 1);
        // already stopped, nothing more to send
        assert!(!mailbox.request_stop(tid).unwrap());
        assert_eq!(mailbox.peek(), Some(StopReason::Signal(Signal::SIGSTOP)));
    }

    #[test]
    fn test_take_rearms_requests() {
        let mailbox = StopMailbox::default();
        let tid = Pid::from_raw(1);

        mailbox.publish(StopReason::Group(Signal::SIGSTOP));
        assert_eq!(mailbox.take(), Some(StopReason::Group(Signal::SIGSTOP)));
        assert_eq!(mailbox.peek(), None);
        assert!(mailbox.request_stop(tid).unwrap());
    }

    #[test]
    fn test_stop_served_by_another_signal_leaves_a_stray() {
        let mailbox = StopMailbox::default();
        let tid = Pid::from_raw(1);

        assert!(mailbox.request_stop(tid).unwrap());
        mailbox.publish(StopReason::Signal(Signal::SIGUSR2));
        assert_eq!(mailbox.wait(tid).unwrap(), StopReason::Signal(Signal::SIGUSR2));
        assert!(mailbox.has_stray());

        mailbox.take();
        assert!(mailbox.swallow_stray());
        assert!(!mailbox.swallow_stray());
        // nothing in flight anymore, the next stop sends again
        assert!(mailbox.request_stop(tid).unwrap());
    }

    #[test]
    fn test_stray_is_adopted_by_the_next_request() {
        let mailbox = StopMailbox::default();
        let tid = Pid::from_raw(1);

        assert!(mailbox.request_stop(tid).unwrap());
        mailbox.publish(StopReason::Signal(Signal::SIGUSR2));
        mailbox.take();

        // the SIGSTOP is still on its way, wait for it instead of sending another
        assert!(!mailbox.request_stop(tid).unwrap());
        assert!(!mailbox.has_stray());
        mailbox.publish(StopReason::Signal(Signal::SIGSTOP));
        assert!(!mailbox.has_stray());
        assert_eq!(mailbox.peek(), Some(StopReason::Signal(Signal::SIGSTOP)));
    }

    #[test]
    fn test_unrequested_stops_leave_no_stray() {
        let mailbox = StopMailbox::default();

        mailbox.publish(StopReason::Signal(Signal::SIGUSR2));
        mailbox.take();
        mailbox.publish(StopReason::Signal(Signal::SIGSTOP));
        assert!(!mailbox.has_stray());
    }

    #[test]
    fn test_close_wakes_waiters() {
        let mailbox = StopMailbox::default();
        let tid = Pid::from_raw(7);

        thread::scope(|s| {
            let waiter = s.spawn(|| mailbox.wait(tid));
            thread::sleep(Duration::from_millis(20));
            mailbox.close();

            let err = waiter.join().unwrap().unwrap_err();
            assert_eq!(err.to_string(), "trace task 7 has exited");
        });

        assert!(mailbox.request_stop(tid).is_err());
    }

    #[test]
    fn test_reinject() {
        assert_eq!(StopReason::Signal(Signal::SIGSTOP).reinject(), None);
        assert_eq!(StopReason::Group(Signal::SIGTSTP).reinject(), None);
        assert_eq!(
            StopReason::Signal(Signal::SIGUSR1).reinject(),
            Some(Signal::SIGUSR1)
        );
    }
}
