//! Helpers shared by the integration tests and the manual driver: spin up a
//! supervisor in-process, launch crash-client child processes, and poke the
//! registration endpoint with raw packets.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
};

/// What a spawned crash-client does once it is registered.
#[derive(Copy, Clone, clap::ValueEnum)]
pub enum ClientMode {
    /// Dereference a bad pointer.
    Segv,
    /// Exit normally with code 0.
    CleanExit,
    /// Sleep until killed from outside.
    Linger,
}

use std::fmt;
impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Segv => "segv",
            Self::CleanExit => "clean-exit",
            Self::Linger => "linger",
        })
    }
}

/// One fault the supervisor captured, along with the artifact the handler
/// wrote for it.
pub struct CapturedFault {
    pub block: crash_warden::FaultBlock,
    pub artifact: PathBuf,
}

pub struct Server {
    /// The registration endpoint clients should connect to.
    pub socket: String,
    pub fault_rx: mpsc::Receiver<CapturedFault>,
    /// Live-client count after each registration.
    pub registered_rx: mpsc::Receiver<usize>,
    /// Live-client count after each teardown.
    pub unregistered_rx: mpsc::Receiver<usize>,
    exit_run_loop: Arc<AtomicBool>,
    run_loop: Option<std::thread::JoinHandle<()>>,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.exit_run_loop.store(true, Ordering::Relaxed);
        if let Some(jh) = self.run_loop.take() {
            jh.join().expect("failed to join server thread");
        }
    }
}

#[inline]
fn artifact_dir() -> PathBuf {
    PathBuf::from(".faults")
}

pub fn spinup_server(id: &str) -> Server {
    let socket = format!("warden-test-{id}");

    let dir = artifact_dir();
    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }

    let mut server =
        crash_warden::Server::with_name(socket.as_str()).expect("failed to start server");

    struct Inner {
        fault_tx: Mutex<mpsc::Sender<CapturedFault>>,
        registered_tx: Mutex<mpsc::Sender<usize>>,
        unregistered_tx: Mutex<mpsc::Sender<usize>>,
    }

    impl crash_warden::ServerHandler for Inner {
        fn capture_dump(
            &self,
            client: &crash_warden::ClientInfo<'_>,
        ) -> Result<(), std::io::Error> {
            let (block, bytes) = read_fault_block(client)?;

            let artifact = artifact_dir().join(format!("{}.fault", uuid::Uuid::new_v4()));
            std::fs::write(&artifact, bytes)?;

            self.fault_tx
                .lock()
                .expect("unable to acquire lock")
                .send(CapturedFault { block, artifact })
                .expect("couldn't send captured fault");

            Ok(())
        }

        fn on_client_registered(&self, num_clients: usize) -> crash_warden::LoopAction {
            self.registered_tx
                .lock()
                .expect("unable to acquire lock")
                .send(num_clients)
                .expect("couldn't send registration count");

            crash_warden::LoopAction::Continue
        }

        fn on_client_unregistered(&self, num_clients: usize) -> crash_warden::LoopAction {
            self.unregistered_tx
                .lock()
                .expect("unable to acquire lock")
                .send(num_clients)
                .expect("couldn't send teardown count");

            crash_warden::LoopAction::Continue
        }
    }

    let (fault_tx, fault_rx) = mpsc::channel();
    let (registered_tx, registered_rx) = mpsc::channel();
    let (unregistered_tx, unregistered_rx) = mpsc::channel();

    let inner = Inner {
        fault_tx: Mutex::new(fault_tx),
        registered_tx: Mutex::new(registered_tx),
        unregistered_tx: Mutex::new(unregistered_tx),
    };

    let exit = Arc::new(AtomicBool::new(false));
    let exit_run_loop = exit.clone();

    let run_loop = std::thread::spawn(move || {
        server
            .run(Box::new(inner), &exit)
            .expect("failed to run server loop");
    });

    Server {
        socket,
        fault_rx,
        registered_rx,
        unregistered_rx,
        exit_run_loop,
        run_loop: Some(run_loop),
    }
}

/// Reads the fault block back out of the faulted process.
#[allow(unsafe_code)]
pub fn read_fault_block(
    client: &crash_warden::ClientInfo<'_>,
) -> std::io::Result<(crash_warden::FaultBlock, Vec<u8>)> {
    let mut buf = vec![0u8; std::mem::size_of::<crash_warden::FaultBlock>()];

    // SAFETY: both iovecs point at memory that stays alive for the call; the
    // remote address is whatever the client registered, which is exactly what
    // this call is allowed to fail on
    let read = unsafe {
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: client.fault_context as *mut libc::c_void,
            iov_len: buf.len(),
        };

        libc::process_vm_readv(client.process_id as i32, &local, 1, &remote, 1, 0)
    };

    if read < 0 {
        return Err(std::io::Error::last_os_error());
    } else if read as usize != buf.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read of fault block",
        ));
    }

    let block = crash_warden::FaultBlock::from_bytes(&buf).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "fault block was malformed")
    })?;

    if block.tag != crash_warden::FaultBlock::MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "fault block tag mismatch",
        ));
    }

    Ok((block, buf))
}

fn client_exe_path() -> PathBuf {
    use std::env;

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");
    if !env::consts::EXE_SUFFIX.is_empty() {
        cmd_path.set_extension(env::consts::EXE_SUFFIX);
    }

    cmd_path
}

/// Launches a crash-client against `socket`, leaving it to the caller to
/// wait on or kill.
pub fn spawn_crash_client(socket: &str, mode: ClientMode) -> std::process::Child {
    let mut cmd = std::process::Command::new(client_exe_path());
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    cmd.args(&["--socket", socket, "--mode", &mode.to_string()]);

    cmd.spawn().expect("failed to run crash-client")
}

/// Launches a crash-client and waits for it to finish, echoing its output so
/// it shows up in failed test logs.
pub fn run_crash_client(socket: &str, mode: ClientMode) -> std::process::Output {
    let child = spawn_crash_client(socket, mode);
    let output = child.wait_with_output().expect("failed to wait for output");

    let stdout = std::str::from_utf8(&output.stdout).expect("invalid stdout");
    let stderr = std::str::from_utf8(&output.stderr).expect("invalid stderr");

    println!("{stdout}");
    eprintln!("{stderr}");

    output
}

/// Connects a raw seqpacket socket to a registration endpoint, for tests
/// that want to speak the protocol badly on purpose.
pub fn raw_connect(socket: &str) -> uds::UnixSeqpacketConn {
    let addr = uds::UnixSocketAddr::from_abstract(socket).expect("invalid socket name");
    uds::UnixSeqpacketConn::connect_unix_addr(&addr).expect("failed to connect")
}

/// Sends one packet and waits for the server's verdict: the ack bytes if it
/// accepted, or `None` if it just closed the connection.
///
/// Any descriptors riding on the ack are deliberately left for the kernel to
/// discard.
pub fn raw_exchange(socket: &str, packet: &[u8]) -> Option<Vec<u8>> {
    let conn = raw_connect(socket);
    conn.send(packet).expect("failed to send packet");

    let mut buf = [0u8; 128];
    let (received, _truncated) = conn.recv(&mut buf).expect("failed to recv reply");

    (received > 0).then(|| buf[..received].to_vec())
}

/// Thread id of the caller; registration wants the real one, not an opaque
/// runtime id.
#[allow(unsafe_code)]
pub fn gettid() -> u32 {
    // SAFETY: no arguments
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[inline]
pub fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    })
}

/// A unique id for one test's socket and artifacts.
pub fn unique_id(name: &str) -> String {
    format!("{name}-{}", uuid::Uuid::new_v4().simple())
}

/// Crashes the calling process with a genuine `SIGSEGV`.
#[allow(unsafe_code)]
pub fn raise_segfault() {
    let s: &u32 = unsafe {
        // avoid the deref_nullptr lint
        fn definitely_not_null() -> *const u32 {
            std::ptr::null()
        }
        &*definitely_not_null()
    };

    println!("crashing by reading a null reference: {s}");
}
