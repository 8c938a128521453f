//! Thin wrappers over the raw socket and process syscalls the protocol
//! needs: packet send/receive with ancillary data, peer credentials, and
//! pidfd acquisition.
//!
//! Everything here works on raw descriptors so the same paths serve the
//! blocking client sockets and the non-blocking server sockets.

#![allow(unsafe_code)]

use std::{
    io,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    time::{Duration, Instant},
};

/// Ancillary payload attached to a received packet.
#[derive(Debug)]
pub(crate) struct Ancillary {
    /// Descriptors delivered via `SCM_RIGHTS`, in transfer order.
    pub fds: Vec<OwnedFd>,
    /// Kernel-checked sender credentials, only present while `SO_PASSCRED`
    /// is enabled on the receiving socket.
    pub creds: Option<libc::ucred>,
    /// True if either the data or the control buffer was too small for what
    /// the sender transmitted.
    pub truncated: bool,
}

struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            end: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Remaining time budget, `None` if unbounded.
    ///
    /// Once expired this returns `Some(0)` so pollers fail fast instead of
    /// blocking.
    fn remaining(&self) -> Option<Duration> {
        self.end
            .map(|end| end.saturating_duration_since(Instant::now()))
    }
}

fn poll_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => d.as_millis().clamp(1, i32::MAX as u128) as libc::c_int,
    }
}

fn poll_fd(fd: RawFd, interest: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = Deadline::new(timeout);

    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: interest,
            revents: 0,
        };

        // SAFETY: syscall, pfd outlives the call
        let ret = unsafe { libc::poll(&mut pfd, 1, poll_millis(deadline.remaining())) };

        if ret > 0 {
            // POLLERR/POLLHUP surface through the subsequent read/write
            return Ok(true);
        } else if ret == 0 {
            return Ok(false);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Waits until the descriptor is readable, `Ok(false)` on timeout.
pub(crate) fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    poll_fd(fd, libc::POLLIN, timeout)
}

fn poll_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    poll_fd(fd, libc::POLLOUT, timeout)
}

// Sized for 2 descriptors plus credentials with room to spare, u64 so the
// control buffer meets cmsghdr alignment.
const CMSG_CAPACITY: usize = 32;

/// Receives one packet, delivered descriptors, and (if enabled on the
/// socket) sender credentials.
///
/// Descriptors arrive with close-on-exec already set. Times out with
/// [`io::ErrorKind::TimedOut`].
pub(crate) fn recv_with_ancillary(
    fd: RawFd,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<(usize, Ancillary)> {
    let deadline = Deadline::new(timeout);

    if !poll_readable(fd, deadline.remaining())? {
        return Err(io::Error::from(io::ErrorKind::TimedOut));
    }

    let mut cmsg_buf = [0u64; CMSG_CAPACITY];

    loop {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };

        // SAFETY: POD init, the pointers stay valid for the duration of the call
        let received = unsafe {
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = std::mem::size_of_val(&cmsg_buf);

            let ret = libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC);

            if ret < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => {
                        if !poll_readable(fd, deadline.remaining())? {
                            return Err(io::Error::from(io::ErrorKind::TimedOut));
                        }
                        continue;
                    }
                    _ => return Err(err),
                }
            }

            let mut ancillary = Ancillary {
                fds: Vec::new(),
                creds: None,
                truncated: msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0,
            };

            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;

                if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                    let data_len =
                        hdr.cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let count = data_len / std::mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg);

                    for i in 0..count {
                        let raw = std::ptr::read_unaligned(
                            data.cast::<RawFd>().add(i),
                        );
                        ancillary.fds.push(OwnedFd::from_raw_fd(raw));
                    }
                } else if hdr.cmsg_level == libc::SOL_SOCKET
                    && hdr.cmsg_type == libc::SCM_CREDENTIALS
                {
                    let data = libc::CMSG_DATA(cmsg);
                    ancillary.creds =
                        Some(std::ptr::read_unaligned(data.cast::<libc::ucred>()));
                }

                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }

            (ret as usize, ancillary)
        };

        return Ok(received);
    }
}

/// Sends one packet with the given descriptors attached as `SCM_RIGHTS`.
///
/// On a packet socket the payload and the rights array are delivered
/// atomically or not at all.
pub(crate) fn send_with_rights(
    fd: RawFd,
    bytes: &[u8],
    rights: &[RawFd],
    timeout: Option<Duration>,
) -> io::Result<()> {
    let deadline = Deadline::new(timeout);
    let mut cmsg_buf = [0u64; CMSG_CAPACITY];

    loop {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr().cast_mut().cast(),
            iov_len: bytes.len(),
        };

        // SAFETY: POD init, the pointers stay valid for the duration of the call
        let sent = unsafe {
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;

            if !rights.is_empty() {
                let payload = std::mem::size_of_val(rights);
                msg.msg_control = cmsg_buf.as_mut_ptr().cast();
                msg.msg_controllen = libc::CMSG_SPACE(payload as u32) as usize;

                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as usize;
                std::ptr::copy_nonoverlapping(
                    rights.as_ptr().cast::<u8>(),
                    libc::CMSG_DATA(cmsg),
                    payload,
                );
            }

            // MSG_NOSIGNAL: a peer that died mid-handshake must surface as
            // EPIPE, not kill the server
            libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL)
        };

        if sent < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if !poll_writable(fd, deadline.remaining())? {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                    continue;
                }
                _ => return Err(err),
            }
        }

        if sent as usize != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "packet was sent incomplete",
            ));
        }

        return Ok(());
    }
}

/// Enables `SO_PASSCRED` on a socket for the scope of the guard.
///
/// Credential passing is only wanted for the handshake read; the guard makes
/// sure it is switched back off on every exit path.
pub(crate) struct PasscredGuard {
    fd: RawFd,
}

impl PasscredGuard {
    pub(crate) fn new(fd: RawFd) -> io::Result<Self> {
        set_passcred(fd, true)?;
        Ok(Self { fd })
    }
}

impl Drop for PasscredGuard {
    fn drop(&mut self) {
        let _ = set_passcred(self.fd, false);
    }
}

fn set_passcred(fd: RawFd, enabled: bool) -> io::Result<()> {
    let val: libc::c_int = i32::from(enabled);

    // SAFETY: syscall, val outlives the call
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&val as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Opens a pidfd for the given process.
///
/// The descriptor becomes readable when the process exits, and also pins the
/// pid against reuse for as long as it is held.
pub(crate) fn pidfd_open(pid: u32) -> io::Result<OwnedFd> {
    // SAFETY: syscall
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0u32) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: pidfd_open descriptors are owned by us and close-on-exec
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

#[inline]
pub(crate) fn gettid() -> u32 {
    // SAFETY: syscall, always succeeds
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::AsRawFd;

    fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];

        // SAFETY: syscall, fds outlives the call
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "{}", io::Error::last_os_error());

        // SAFETY: fresh descriptors owned by the caller
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn passes_bytes() {
        let (a, b) = seqpacket_pair();

        send_with_rights(a.as_raw_fd(), b"hello", &[], None).unwrap();

        let mut buf = [0u8; 64];
        let (n, anc) = recv_with_ancillary(b.as_raw_fd(), &mut buf, None).unwrap();

        assert_eq!(&buf[..n], b"hello");
        assert!(anc.fds.is_empty());
        assert!(anc.creds.is_none());
        assert!(!anc.truncated);
    }

    #[test]
    fn passes_descriptors() {
        let (a, b) = seqpacket_pair();
        let (x, y) = seqpacket_pair();

        send_with_rights(a.as_raw_fd(), b"rights", &[x.as_raw_fd(), y.as_raw_fd()], None).unwrap();

        let mut buf = [0u8; 64];
        let (n, anc) = recv_with_ancillary(b.as_raw_fd(), &mut buf, None).unwrap();

        assert_eq!(&buf[..n], b"rights");
        assert_eq!(anc.fds.len(), 2);

        // the transferred descriptors are live sockets, a write through the
        // duplicate must pop out of its original peer
        send_with_rights(anc.fds[0].as_raw_fd(), b"ping", &[], None).unwrap();
        let (n, _) = recv_with_ancillary(y.as_raw_fd(), &mut buf, None).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn passes_credentials() {
        let (a, b) = seqpacket_pair();

        let guard = PasscredGuard::new(b.as_raw_fd()).unwrap();
        send_with_rights(a.as_raw_fd(), b"creds", &[], None).unwrap();

        let mut buf = [0u8; 64];
        let (_, anc) = recv_with_ancillary(b.as_raw_fd(), &mut buf, None).unwrap();

        let creds = anc.creds.expect("credentials missing");
        assert_eq!(creds.pid as u32, std::process::id());
        drop(guard);

        // after the guard reverts the option no further credentials arrive
        send_with_rights(a.as_raw_fd(), b"bare", &[], None).unwrap();
        let (_, anc) = recv_with_ancillary(b.as_raw_fd(), &mut buf, None).unwrap();
        assert!(anc.creds.is_none());
    }

    #[test]
    fn recv_times_out() {
        let (_a, b) = seqpacket_pair();

        let mut buf = [0u8; 16];
        let err = recv_with_ancillary(
            b.as_raw_fd(),
            &mut buf,
            Some(Duration::from_millis(50)),
        )
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn watches_process_exit() {
        let pid = std::process::id();
        let pidfd = pidfd_open(pid).unwrap();

        // we are alive, the pidfd must not be readable
        assert!(!poll_readable(pidfd.as_raw_fd(), Some(Duration::from_millis(10))).unwrap());
    }
}
