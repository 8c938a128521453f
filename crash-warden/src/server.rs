//! Server side of the registration protocol: endpoint binding, the listener
//! pool that runs handshakes, and the run loop that drains the completion
//! queue.

mod identity;
mod registry;
mod waiter;

use crate::{
    errors::Error,
    events::EventPair,
    ipc::{self, RegistrationAck, RegistrationRequest, SocketName},
    sys, LoopAction, ServerHandler,
};
use registry::{ClientEvent, ClientRecord, ClientRegistry};
use std::{
    os::fd::AsRawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

/// Tunables for the supervisor.
#[derive(Copy, Clone, Debug)]
pub struct ServerOptions {
    /// Number of concurrent listener workers. Registration cost is
    /// dominated by the identity syscalls, so a couple of workers let the
    /// server absorb bursts of simultaneous registrations.
    pub listeners: usize,
    /// How long one connection may take for its request/ack exchange before
    /// it is abandoned.
    pub handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listeners: 2,
            handshake_timeout: Duration::from_secs(1),
        }
    }
}

/// The supervisor side: accepts registrations and watches every registered
/// client until it faults or exits.
pub struct Server {
    listener: Arc<uds::nonblocking::UnixSeqpacketListener>,
    socket_path: Option<PathBuf>,
    options: ServerOptions,
    live: Arc<AtomicUsize>,
}

impl Server {
    /// Binds the endpoint with default options.
    ///
    /// # Errors
    ///
    /// The socket name is invalid or binding fails, eg. another server
    /// already owns the name. Failing to bind is fatal on purpose, a
    /// supervisor that cannot listen has no reason to run.
    pub fn with_name<'scope>(name: impl Into<SocketName<'scope>>) -> Result<Self, Error> {
        Self::with_options(name, ServerOptions::default())
    }

    /// Binds the endpoint.
    ///
    /// # Errors
    ///
    /// See [`Self::with_name`].
    pub fn with_options<'scope>(
        name: impl Into<SocketName<'scope>>,
        options: ServerOptions,
    ) -> Result<Self, Error> {
        let name = name.into();

        let socket_path = match &name {
            SocketName::Path(path) => Some(path.to_path_buf()),
            SocketName::Abstract(_) => None,
        };

        let addr = ipc::socket_addr(&name)?;
        let listener = uds::nonblocking::UnixSeqpacketListener::bind_unix_addr(&addr)?;

        Ok(Self {
            listener: Arc::new(listener),
            socket_path,
            options,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of currently registered clients.
    pub fn live_clients(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Runs the listener pool and processes client events until `shutdown`
    /// is set or a handler callback asks to exit.
    ///
    /// The calling thread becomes the single consumer of the completion
    /// queue: every registration, capture, and teardown is applied here, in
    /// arrival order.
    ///
    /// # Errors
    ///
    /// Failure to create the waiter machinery or to spawn a listener
    /// worker. Per-connection failures never surface here, they abort only
    /// the connection that caused them.
    pub fn run(
        &mut self,
        handler: Box<dyn ServerHandler>,
        shutdown: &AtomicBool,
    ) -> Result<(), Error> {
        let (queue, completions) = mpsc::channel();
        let mut registry = ClientRegistry::new(queue.clone(), self.live.clone())?;

        let stop = Arc::new(AtomicBool::new(false));
        let tokens = Arc::new(AtomicU64::new(1));
        let mut workers = Vec::with_capacity(self.options.listeners.max(1));

        for index in 0..self.options.listeners.max(1) {
            let listener = self.listener.clone();
            let queue = queue.clone();
            let worker_stop = stop.clone();
            let tokens = tokens.clone();
            let handshake_timeout = self.options.handshake_timeout;

            let worker = std::thread::Builder::new()
                .name(format!("warden-listener-{index}"))
                .spawn(move || {
                    listener_loop(&listener, &queue, &worker_stop, &tokens, handshake_timeout);
                });

            match worker {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    stop.store(true, Ordering::Release);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    registry.shutdown();
                    return Err(err.into());
                }
            }
        }

        // the registry keeps its own sender, this one has done its job
        drop(queue);

        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }

            match completions.recv_timeout(Duration::from_millis(10)) {
                Ok(event) => {
                    if registry.process(event, handler.as_ref()) == LoopAction::Exit {
                        log::debug!("handler exited message loop");
                        break Ok(());
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break Ok(()),
            }
        };

        stop.store(true, Ordering::Release);
        for worker in workers {
            let _ = worker.join();
        }
        registry.shutdown();

        result
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn listener_loop(
    listener: &uds::nonblocking::UnixSeqpacketListener,
    queue: &mpsc::Sender<ClientEvent>,
    stop: &AtomicBool,
    tokens: &AtomicU64,
    handshake_timeout: Duration,
) {
    while !stop.load(Ordering::Acquire) {
        match sys::poll_readable(listener.as_raw_fd(), Some(Duration::from_millis(100))) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                log::error!("listener poll failed: {err}");
                continue;
            }
        }

        let (socket, _addr) = match listener.accept_unix_addr() {
            Ok(accepted) => accepted,
            // every worker polls the same listener, losing the race for a
            // connection is routine
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                log::error!("failed to accept socket connection: {err}");
                continue;
            }
        };

        let token = tokens.fetch_add(1, Ordering::Relaxed);

        match handshake(&socket, token, handshake_timeout) {
            Ok(record) => {
                log::debug!("accepted registration for client {token}");
                if queue.send(ClientEvent::Registered(record)).is_err() {
                    // the aggregator is gone, nothing left to do
                    return;
                }
            }
            Err(err) => {
                log::debug!("rejected registration attempt: {err}");
            }
        }

        // connection dropped here: one exchange per connection
    }
}

/// Runs one registration exchange on a fresh connection.
///
/// Any failure aborts just this connection; the caller goes back to
/// accepting.
fn handshake(
    socket: &uds::nonblocking::UnixSeqpacketConn,
    token: u64,
    timeout: Duration,
) -> Result<Box<ClientRecord>, Error> {
    // Credentials are only wanted for the one handshake read; the guard
    // reverts the option on every path out of here.
    let passcred = sys::PasscredGuard::new(socket.as_raw_fd())?;

    // oversized requests land in the slack and fail the size check instead
    // of being silently clipped
    let mut buf = [0u8; std::mem::size_of::<RegistrationRequest>() + 40];
    let (received, ancillary) =
        sys::recv_with_ancillary(socket.as_raw_fd(), &mut buf, Some(timeout))?;
    drop(passcred);

    if received == 0 {
        return Err(Error::ConnectionClosed);
    }

    let request =
        RegistrationRequest::from_bytes(&buf[..received]).ok_or(Error::WrongMessageSize {
            expected: std::mem::size_of::<RegistrationRequest>(),
            received,
        })?;

    if request.magic != RegistrationRequest::MAGIC {
        return Err(Error::BadMagic);
    }

    let verified = identity::verify(socket, ancillary.creds.as_ref(), request.process_id)?;

    // Created together, transferred together on the ack. If either step
    // fails both descriptors die with the EventPair, a client never sees
    // half a pair.
    let events = EventPair::new()?;
    let ack = RegistrationAck::new(0, 1);
    sys::send_with_rights(
        socket.as_raw_fd(),
        ack.as_bytes(),
        &events.rights(),
        Some(timeout),
    )?;

    Ok(Box::new(ClientRecord::new(
        token,
        verified.pid,
        request.thread_id,
        request.fault_context,
        verified.process,
        events,
    )))
}
