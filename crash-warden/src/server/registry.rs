//! The central event aggregator.
//!
//! Every state transition for every client funnels through one consumer:
//! listeners post `Registered`, waiter callbacks post `DumpRequested` and
//! `Exited`, and [`ClientRegistry::process`] applies them in arrival order.
//! Nothing else ever mutates a [`ClientRecord`] or releases its resources,
//! which is what keeps the two per-client waiters, the capture step, and
//! teardown free of races.

use super::waiter::{WaitHandle, WaitPool};
use crate::{events::EventPair, ClientInfo, LoopAction, ServerHandler};
use std::{
    collections::HashMap,
    io,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
        Arc,
    },
};

/// A proposed state transition, one per completion-queue item.
pub(crate) enum ClientEvent {
    /// A listener finished a handshake; the record rides along.
    Registered(Box<ClientRecord>),
    /// The client's dump-request event fired.
    DumpRequested { token: u64 },
    /// The client's process went away.
    Exited { token: u64 },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ClientState {
    /// Handshake done, both waiters armed.
    Registered,
    /// Capture ran (successfully or not) and dump-done was signaled. The
    /// record stays around until the process exits.
    DumpReady,
    /// Terminal; only ever observed on a record that is about to be
    /// dropped.
    Unregistered,
}

/// Server-side bookkeeping for one registered client.
pub(crate) struct ClientRecord {
    pub token: u64,
    pub pid: u32,
    pub thread_id: u32,
    pub fault_context: u64,
    pub process: OwnedFd,
    pub events: EventPair,
    pub state: ClientState,
    dump_request_waiter: Option<WaitHandle>,
    process_exit_waiter: Option<WaitHandle>,
}

impl ClientRecord {
    pub(crate) fn new(
        token: u64,
        pid: u32,
        thread_id: u32,
        fault_context: u64,
        process: OwnedFd,
        events: EventPair,
    ) -> Self {
        Self {
            token,
            pid,
            thread_id,
            fault_context,
            process,
            events,
            state: ClientState::Registered,
            dump_request_waiter: None,
            process_exit_waiter: None,
        }
    }

    /// Cancels both waiters, blocking until any in-flight callback has
    /// drained. Only after this may the record's descriptors be closed.
    fn release_waiters(&mut self) {
        if let Some(waiter) = self.dump_request_waiter.take() {
            waiter.cancel();
        }
        if let Some(waiter) = self.process_exit_waiter.take() {
            waiter.cancel();
        }
    }
}

pub(crate) struct ClientRegistry {
    clients: HashMap<u64, Box<ClientRecord>>,
    pool: WaitPool,
    queue: mpsc::Sender<ClientEvent>,
    live: Arc<AtomicUsize>,
}

impl ClientRegistry {
    pub(crate) fn new(
        queue: mpsc::Sender<ClientEvent>,
        live: Arc<AtomicUsize>,
    ) -> io::Result<Self> {
        Ok(Self {
            clients: HashMap::new(),
            pool: WaitPool::new()?,
            queue,
            live,
        })
    }

    /// Applies one transition. Unknown tokens are stale events from a
    /// cancellation race and are ignored.
    pub(crate) fn process(
        &mut self,
        event: ClientEvent,
        handler: &dyn ServerHandler,
    ) -> LoopAction {
        match event {
            ClientEvent::Registered(record) => self.insert(record, handler),
            ClientEvent::DumpRequested { token } => self.dump_ready(token, handler),
            ClientEvent::Exited { token } => self.unregister(token, handler),
        }
    }

    fn insert(&mut self, mut record: Box<ClientRecord>, handler: &dyn ServerHandler) -> LoopAction {
        let token = record.token;

        // Both eventfd and pidfd readiness are level triggered, so a client
        // that crashed or exited before we got here is still observed the
        // moment the waiter is armed.
        let dump_request_waiter = {
            let queue = self.queue.clone();
            self.pool.register(record.events.request_fd(), move || {
                let _ = queue.send(ClientEvent::DumpRequested { token });
            })
        };

        let dump_request_waiter = match dump_request_waiter {
            Ok(waiter) => waiter,
            Err(err) => {
                log::error!("failed to arm dump-request waiter for client {token}: {err}");
                return LoopAction::Continue;
            }
        };

        let process_exit_waiter = {
            let queue = self.queue.clone();
            self.pool.register(record.process.as_raw_fd(), move || {
                let _ = queue.send(ClientEvent::Exited { token });
            })
        };

        let process_exit_waiter = match process_exit_waiter {
            Ok(waiter) => waiter,
            Err(err) => {
                log::error!("failed to arm process-exit waiter for client {token}: {err}");
                dump_request_waiter.cancel();
                return LoopAction::Continue;
            }
        };

        record.dump_request_waiter = Some(dump_request_waiter);
        record.process_exit_waiter = Some(process_exit_waiter);

        let pid = record.pid;
        self.clients.insert(token, record);

        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("client {token} (pid {pid}) registered, {live} live");

        handler.on_client_registered(live)
    }

    fn dump_ready(&mut self, token: u64, handler: &dyn ServerHandler) -> LoopAction {
        let Some(record) = self.clients.get_mut(&token) else {
            log::debug!("dump request for unknown client {token}");
            return LoopAction::Continue;
        };

        if record.state != ClientState::Registered {
            log::debug!("duplicate dump request for client {token}");
            return LoopAction::Continue;
        }

        record.state = ClientState::DumpReady;

        let info = ClientInfo {
            process_id: record.pid,
            thread_id: record.thread_id,
            fault_context: record.fault_context,
            process_handle: record.process.as_fd(),
        };

        match handler.capture_dump(&info) {
            Ok(()) => log::info!("captured dump for client {token} (pid {})", record.pid),
            Err(err) => log::error!("failed to capture dump for client {token}: {err}"),
        }

        // Whatever the capture outcome, the faulting process must not stay
        // blocked on the rendezvous.
        if let Err(err) = record.events.signal_done() {
            log::error!("failed to signal dump-done for client {token}: {err}");
        }

        LoopAction::Continue
    }

    fn unregister(&mut self, token: u64, handler: &dyn ServerHandler) -> LoopAction {
        let Some(mut record) = self.clients.remove(&token) else {
            log::debug!("exit event for unknown client {token}");
            return LoopAction::Continue;
        };

        record.release_waiters();
        record.state = ClientState::Unregistered;

        let live = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
        log::debug!("client {token} (pid {}) unregistered, {live} live", record.pid);

        // descriptors close here, after both waiters have drained
        drop(record);

        handler.on_client_unregistered(live)
    }

    /// Tears down every record and stops the waiter pool. Handler callbacks
    /// are not invoked for records torn down this way.
    pub(crate) fn shutdown(&mut self) {
        for (_token, mut record) in self.clients.drain() {
            record.release_waiters();
            self.live.fetch_sub(1, Ordering::Relaxed);
        }

        self.pool.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{events, sys};
    use std::time::Duration;

    struct RecordingHandler {
        captured: parking_lot::Mutex<Vec<(u32, u32, u64)>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                captured: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    impl ServerHandler for RecordingHandler {
        fn capture_dump(&self, client: &ClientInfo<'_>) -> Result<(), std::io::Error> {
            self.captured
                .lock()
                .push((client.process_id, client.thread_id, client.fault_context));
            Ok(())
        }
    }

    fn fresh_record(token: u64) -> (Box<ClientRecord>, std::os::fd::RawFd, std::os::fd::RawFd) {
        let pair = EventPair::new().unwrap();
        let request_fd = pair.request_fd();
        let done_fd = pair.done_fd();

        let record = Box::new(ClientRecord::new(
            token,
            std::process::id(),
            sys::gettid(),
            0xfee1_dead,
            sys::pidfd_open(std::process::id()).unwrap(),
            pair,
        ));

        (record, request_fd, done_fd)
    }

    #[test]
    fn dump_request_captures_exactly_once() {
        let (queue, completions) = mpsc::channel();
        let live = Arc::new(AtomicUsize::new(0));
        let mut registry = ClientRegistry::new(queue, live.clone()).unwrap();
        let handler = RecordingHandler::new();

        let (record, request_fd, done_fd) = fresh_record(1);

        assert_eq!(
            registry.process(ClientEvent::Registered(record), &handler),
            LoopAction::Continue
        );
        assert_eq!(live.load(Ordering::Relaxed), 1);

        // simulate the client's fault handler
        events::signal(request_fd).unwrap();

        let event = completions.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(registry.process(event, &handler), LoopAction::Continue);

        let captured = handler.captured.lock().clone();
        assert_eq!(captured, vec![(std::process::id(), sys::gettid(), 0xfee1_dead)]);

        // the faulting client must have been released
        assert!(events::wait(done_fd, Some(Duration::from_secs(1))).unwrap());

        // a stale second request is a no-op
        assert_eq!(
            registry.process(ClientEvent::DumpRequested { token: 1 }, &handler),
            LoopAction::Continue
        );
        assert_eq!(handler.captured.lock().len(), 1);

        registry.shutdown();
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let (queue, _completions) = mpsc::channel();
        let live = Arc::new(AtomicUsize::new(0));
        let mut registry = ClientRegistry::new(queue, live.clone()).unwrap();
        let handler = RecordingHandler::new();

        assert_eq!(
            registry.process(ClientEvent::DumpRequested { token: 99 }, &handler),
            LoopAction::Continue
        );
        assert_eq!(
            registry.process(ClientEvent::Exited { token: 42 }, &handler),
            LoopAction::Continue
        );

        assert!(handler.captured.lock().is_empty());
        assert_eq!(live.load(Ordering::Relaxed), 0);

        registry.shutdown();
    }

    #[test]
    fn shutdown_releases_pending_records() {
        let (queue, _completions) = mpsc::channel();
        let live = Arc::new(AtomicUsize::new(0));
        let mut registry = ClientRegistry::new(queue, live.clone()).unwrap();
        let handler = RecordingHandler::new();

        let (record, _request_fd, _done_fd) = fresh_record(1);
        registry.process(ClientEvent::Registered(record), &handler);
        let (record, _request_fd, _done_fd) = fresh_record(2);
        registry.process(ClientEvent::Registered(record), &handler);

        assert_eq!(live.load(Ordering::Relaxed), 2);

        registry.shutdown();
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }
}
