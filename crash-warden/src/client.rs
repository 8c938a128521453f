//! Client side of the registration protocol, which runs in the process that
//! wants an external supervisor to capture its crashes.

use crate::{
    errors::Error,
    fault::{self, FaultBlock},
    ipc::{self, OwnedSocketName, RegistrationAck, RegistrationRequest, SocketName},
    sys,
};
use std::{
    os::fd::{AsRawFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Tunables for one registration.
///
/// Registration talks to a server that may still be starting up, so the
/// connect step retries with a short delay; everything together is bounded
/// by `register_timeout`.
#[derive(Copy, Clone, Debug)]
pub struct ClientOptions {
    /// How often to re-attempt the connect while the server is not yet
    /// listening.
    pub connect_retries: u32,
    /// Delay between connect attempts.
    pub retry_delay: Duration,
    /// Overall budget for connect + send + receive.
    pub register_timeout: Duration,
    /// How long the fault handler waits for the supervisor to finish its
    /// capture before letting the process die anyway.
    pub rendezvous_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_retries: 20,
            retry_delay: Duration::from_millis(100),
            register_timeout: Duration::from_secs(5),
            rendezvous_timeout: Duration::from_secs(30),
        }
    }
}

/// Where this process's registration currently stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MonitorStatus {
    /// The background registration has not settled yet.
    Pending,
    /// Registration succeeded and the fault handler is armed.
    Monitored,
    /// Registration failed, the process runs without crash reporting.
    /// [`Client::last_error`] says why.
    Unmonitored,
}

const STATUS_PENDING: u8 = 0;
const STATUS_MONITORED: u8 = 1;
const STATUS_UNMONITORED: u8 = 2;

/// A completed handshake: both signaling descriptors received from the
/// server plus the fault block whose address the server knows.
///
/// Produced by [`Client::register_blocking`]; most users never see this type
/// since [`Client::register`] arms the fault handler with it internally, but
/// tools that drive the rendezvous themselves can take it apart.
pub struct Registration {
    /// Signaled towards the server to ask for a capture.
    pub dump_request: OwnedFd,
    /// Signaled by the server once the capture has finished.
    pub dump_done: OwnedFd,
    /// The block the server will read during capture. Its address was
    /// transmitted in the request, so it must stay put for as long as the
    /// registration is live.
    pub block: Box<FaultBlock>,
}

struct Shared {
    status: AtomicU8,
    error: parking_lot::Mutex<Option<Error>>,
    cancelled: AtomicBool,
}

impl Shared {
    fn settle(&self, result: Result<(), Error>) {
        match result {
            Ok(()) => {
                self.status.store(STATUS_MONITORED, Ordering::Release);
            }
            Err(err) => {
                *self.error.lock() = Some(err);
                self.status.store(STATUS_UNMONITORED, Ordering::Release);
            }
        }
    }
}

/// Registers this process with a crash supervisor and keeps the resulting
/// fault handler alive.
///
/// Dropping the client disarms the handler again, waiting first for a still
/// in-flight registration to settle.
pub struct Client {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Client {
    /// Starts registering this process with the server listening on `name`.
    ///
    /// This never blocks: the handshake runs on a background thread and the
    /// fault handler is armed from there, only if every step succeeded. Call
    /// [`Self::status`] or [`Self::wait_for_registration`] to learn the
    /// outcome; a failed registration simply leaves the process unmonitored.
    pub fn register<'scope>(name: impl Into<SocketName<'scope>>, options: ClientOptions) -> Self {
        let owned = OwnedSocketName::from(name.into());

        let shared = Arc::new(Shared {
            status: AtomicU8::new(STATUS_PENDING),
            error: parking_lot::Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });

        let worker = {
            let shared = shared.clone();

            std::thread::Builder::new()
                .name("warden-register".into())
                .spawn(move || {
                    let result = Self::register_blocking(owned.as_name(), options)
                        .and_then(|registration| {
                            if shared.cancelled.load(Ordering::Acquire) {
                                // the owning Client is already gone, let the
                                // descriptors drop unarmed
                                return Ok(());
                            }

                            fault::install(
                                registration.dump_request,
                                registration.dump_done,
                                registration.block,
                                options.rendezvous_timeout,
                            )
                        });

                    shared.settle(result);
                })
        };

        match worker {
            Ok(thread) => Self {
                shared,
                thread: Some(thread),
            },
            Err(err) => {
                shared.settle(Err(err.into()));
                Self {
                    shared,
                    thread: None,
                }
            }
        }
    }

    /// Performs the registration handshake synchronously and hands back the
    /// raw result without arming any fault handler.
    ///
    /// One fresh connection per call: connect (with retries while the server
    /// is not yet listening), send the request, receive the acknowledgment
    /// and its descriptor pair, disconnect.
    ///
    /// # Errors
    ///
    /// The socket name is invalid, the server stays unreachable past the
    /// retry budget, the exchange times out, or the acknowledgment is
    /// malformed or missing either descriptor.
    pub fn register_blocking<'scope>(
        name: impl Into<SocketName<'scope>>,
        options: ClientOptions,
    ) -> Result<Registration, Error> {
        let addr = ipc::socket_addr(&name.into())?;
        let deadline = Instant::now() + options.register_timeout;

        let socket = {
            let mut attempts = 0;
            loop {
                match uds::UnixSeqpacketConn::connect_unix_addr(&addr) {
                    Ok(socket) => break socket,
                    Err(err) => {
                        attempts += 1;
                        if attempts > options.connect_retries {
                            return Err(err.into());
                        }
                        if Instant::now() + options.retry_delay >= deadline {
                            return Err(Error::Timeout);
                        }
                        std::thread::sleep(options.retry_delay);
                    }
                }
            }
        };

        let block = Box::new(FaultBlock::new(std::process::id()));
        let request = RegistrationRequest::new(
            std::process::id(),
            sys::gettid(),
            std::ptr::addr_of!(*block) as u64,
        );

        sys::send_with_rights(
            socket.as_raw_fd(),
            request.as_bytes(),
            &[],
            Some(deadline.saturating_duration_since(Instant::now())),
        )
        .map_err(map_timeout)?;

        let mut buf = [0u8; std::mem::size_of::<RegistrationAck>()];
        let (received, ancillary) = sys::recv_with_ancillary(
            socket.as_raw_fd(),
            &mut buf,
            Some(deadline.saturating_duration_since(Instant::now())),
        )
        .map_err(map_timeout)?;

        if received == 0 {
            return Err(Error::ConnectionClosed);
        }

        let ack = RegistrationAck::from_bytes(&buf[..received]).ok_or(Error::WrongMessageSize {
            expected: std::mem::size_of::<RegistrationAck>(),
            received,
        })?;

        if ack.magic != RegistrationAck::MAGIC {
            return Err(Error::BadMagic);
        }

        // The ack names the slots of the two descriptors in the rights
        // array; both must be present and distinct or the registration is
        // void as a whole.
        let mut slots: Vec<Option<OwnedFd>> = ancillary.fds.into_iter().map(Some).collect();

        let mut take = |index: u64| {
            slots
                .get_mut(index as usize)
                .and_then(Option::take)
                .ok_or(Error::MissingHandles)
        };

        let dump_request = take(ack.dump_request_handle)?;
        let dump_done = take(ack.dump_done_handle)?;

        Ok(Registration {
            dump_request,
            dump_done,
            block,
        })
    }

    /// The current registration outcome.
    pub fn status(&self) -> MonitorStatus {
        match self.shared.status.load(Ordering::Acquire) {
            STATUS_MONITORED => MonitorStatus::Monitored,
            STATUS_UNMONITORED => MonitorStatus::Unmonitored,
            _ => MonitorStatus::Pending,
        }
    }

    /// Why the process ended up unmonitored, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.shared.error.lock().as_ref().map(|err| err.to_string())
    }

    /// Waits until the background registration settles, up to `timeout`.
    ///
    /// Returns the status reached by then, which is still `Pending` if the
    /// handshake is taking longer than the given patience.
    pub fn wait_for_registration(&self, timeout: Duration) -> MonitorStatus {
        let deadline = Instant::now() + timeout;

        loop {
            let status = self.status();
            if status != MonitorStatus::Pending || Instant::now() >= deadline {
                return status;
            }

            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.cancelled.store(true, Ordering::Release);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        if self.status() == MonitorStatus::Monitored {
            fault::detach();
        }
    }
}

#[inline]
fn map_timeout(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::TimedOut {
        Error::Timeout
    } else {
        err.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unreachable_server_is_observable() {
        let options = ClientOptions {
            connect_retries: 1,
            retry_delay: Duration::from_millis(10),
            register_timeout: Duration::from_millis(500),
            ..Default::default()
        };

        let client = Client::register("cw-client-nobody-listens", options);
        let status = client.wait_for_registration(Duration::from_secs(5));

        assert_eq!(status, MonitorStatus::Unmonitored);
        assert!(client.last_error().is_some());
    }
}
