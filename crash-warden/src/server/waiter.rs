//! One-shot readiness subscriptions without a thread per descriptor.
//!
//! A single poller thread multiplexes every armed descriptor; when one
//! becomes readable its callback is dispatched on a transient thread and the
//! subscription is spent. [`WaitHandle::cancel`] is deliberately blocking:
//! once it returns, the callback has either never run or has fully finished,
//! so the caller can release the descriptor and whatever state the callback
//! touches.

#![allow(unsafe_code)]

use polling::{Event, Events, Poller};
use std::{
    collections::HashMap,
    io,
    os::fd::{BorrowedFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Copy, Clone, PartialEq, Eq)]
enum Phase {
    /// Still waiting for the descriptor.
    Armed,
    /// The callback is running on a dispatch thread.
    Running,
    /// The callback has finished (or will never run).
    Finished,
}

struct FireState {
    phase: parking_lot::Mutex<Phase>,
    drained: parking_lot::Condvar,
}

impl FireState {
    fn new() -> Self {
        Self {
            phase: parking_lot::Mutex::new(Phase::Armed),
            drained: parking_lot::Condvar::new(),
        }
    }

    fn set(&self, phase: Phase) {
        *self.phase.lock() = phase;

        if phase == Phase::Finished {
            self.drained.notify_all();
        }
    }
}

struct Slot {
    fd: RawFd,
    callback: Box<dyn FnOnce() + Send>,
    state: Arc<FireState>,
}

struct PoolShared {
    poller: Poller,
    slots: parking_lot::Mutex<HashMap<usize, Slot>>,
    next_key: AtomicUsize,
    shutdown: AtomicBool,
}

/// The arena of armed subscriptions plus the poller thread driving them.
pub(crate) struct WaitPool {
    shared: Arc<PoolShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WaitPool {
    pub(crate) fn new() -> io::Result<Self> {
        let shared = Arc::new(PoolShared {
            poller: Poller::new()?,
            slots: parking_lot::Mutex::new(HashMap::new()),
            next_key: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("warden-waiter".into())
                .spawn(move || poll_loop(&shared))?
        };

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Arms a one-shot subscription: when `fd` becomes readable, `callback`
    /// runs exactly once on a transient thread.
    ///
    /// The descriptor must stay open until the subscription fires or is
    /// cancelled; the pool never owns it.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        callback: impl FnOnce() + Send + 'static,
    ) -> io::Result<WaitHandle> {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(FireState::new());

        self.shared.slots.lock().insert(
            key,
            Slot {
                fd,
                callback: Box::new(callback),
                state: state.clone(),
            },
        );

        // SAFETY: the caller keeps fd open until the subscription is spent or
        // cancelled, and dispatch/cancel both delete it from the poller
        // before the slot goes away
        if let Err(err) = unsafe { self.shared.poller.add(fd, Event::readable(key)) } {
            self.shared.slots.lock().remove(&key);
            return Err(err);
        }

        Ok(WaitHandle {
            key,
            shared: self.shared.clone(),
            state,
        })
    }

    /// Stops the poller thread. Any still-armed subscription is marked
    /// finished without running its callback, so late cancels cannot hang.
    pub(crate) fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.poller.notify();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WaitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(shared: &PoolShared) {
    let mut events = Events::new();

    loop {
        events.clear();

        match shared.poller.wait(&mut events, None) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("waiter poll failed: {err}");
                break;
            }
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        for event in events.iter() {
            dispatch(shared, event.key);
        }
    }

    // leftovers can no longer fire, unblock anyone who cancels them late
    for (_key, slot) in shared.slots.lock().drain() {
        // SAFETY: the subscription was never spent, its descriptor is still
        // open per the register contract
        let _ = shared.poller.delete(unsafe { BorrowedFd::borrow_raw(slot.fd) });
        slot.state.set(Phase::Finished);
    }
}

fn dispatch(shared: &PoolShared, key: usize) {
    // A concurrent cancel may have emptied the slot already, readiness for
    // an unknown key is a no-op.
    let Some(slot) = shared.slots.lock().remove(&key) else {
        return;
    };

    // SAFETY: the slot was still armed, so per the register contract the
    // descriptor is still open
    let _ = shared.poller.delete(unsafe { BorrowedFd::borrow_raw(slot.fd) });

    slot.state.set(Phase::Running);

    let state = slot.state;
    let callback = slot.callback;
    let finished = state.clone();

    let spawned = std::thread::Builder::new()
        .name("warden-dispatch".into())
        .spawn(move || {
            callback();
            finished.set(Phase::Finished);
        });

    if let Err(err) = spawned {
        // the callback is lost, but nothing may stay blocked on it
        log::error!("failed to spawn dispatch thread: {err}");
        state.set(Phase::Finished);
    }
}

/// Owner side of one subscription.
pub(crate) struct WaitHandle {
    key: usize,
    shared: Arc<PoolShared>,
    state: Arc<FireState>,
}

impl WaitHandle {
    /// Tears the subscription down.
    ///
    /// If the callback never fired it never will; if it is currently
    /// running, this blocks until it has finished. Either way the poller has
    /// forgotten the descriptor when this returns.
    pub(crate) fn cancel(self) {
        let removed = self.shared.slots.lock().remove(&self.key);

        match removed {
            Some(slot) => {
                // SAFETY: armed slot, descriptor still open per the register
                // contract
                let _ = self.shared.poller.delete(unsafe { BorrowedFd::borrow_raw(slot.fd) });
            }
            None => {
                // Dispatch owns it. Wait out the callback; a subscription
                // that already finished passes straight through.
                let mut phase = self.state.phase.lock();
                while *phase != Phase::Finished {
                    self.state.drained.wait(&mut phase);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::{self, EventPair};
    use std::{sync::mpsc, time::Duration};

    #[test]
    fn fires_exactly_once() {
        let mut pool = WaitPool::new().unwrap();
        let pair = EventPair::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let _handle = pool
            .register(pair.request_fd(), move || {
                tx.send(()).unwrap();
            })
            .unwrap();

        events::signal(pair.request_fd()).unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // the descriptor stays readable but the subscription is spent
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        pool.shutdown();
    }

    #[test]
    fn cancel_before_fire_suppresses_callback() {
        let mut pool = WaitPool::new().unwrap();
        let pair = EventPair::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = pool
            .register(pair.request_fd(), move || {
                tx.send(()).unwrap();
            })
            .unwrap();

        handle.cancel();
        events::signal(pair.request_fd()).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        pool.shutdown();
    }

    #[test]
    fn cancel_drains_running_callback() {
        let mut pool = WaitPool::new().unwrap();
        let pair = EventPair::new().unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let handle = pool
            .register(pair.request_fd(), move || {
                started_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(200));
                done_tx.send(()).unwrap();
            })
            .unwrap();

        events::signal(pair.request_fd()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // the callback is mid-flight, cancel must block until it finishes
        handle.cancel();
        assert!(done_rx.try_recv().is_ok());

        pool.shutdown();
    }

    #[test]
    fn independent_subscriptions_do_not_interfere() {
        let mut pool = WaitPool::new().unwrap();
        let first = EventPair::new().unwrap();
        let second = EventPair::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let tx_first = tx.clone();
        let _first = pool
            .register(first.request_fd(), move || {
                tx_first.send(1).unwrap();
            })
            .unwrap();
        let _second = pool
            .register(second.request_fd(), move || {
                tx.send(2).unwrap();
            })
            .unwrap();

        events::signal(second.request_fd()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        pool.shutdown();
    }
}
