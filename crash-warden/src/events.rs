//! The per-client signaling pair.
//!
//! Each registered client gets two eventfds, `dump-request` (signaled by the
//! client's fault handler) and `dump-done` (signaled by the server once the
//! capture step has finished). They are written once and never read back, so
//! once signaled they stay readable for every poller, which is exactly the
//! manual-reset behavior the one-shot rendezvous needs.

use crate::sys;
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

/// The two signaling primitives backing one client registration.
///
/// Created together and released together. The duplicates handed to the
/// client are produced by attaching both descriptors to the acknowledgment
/// message, so a client either receives the whole pair or nothing.
pub(crate) struct EventPair {
    dump_request: OwnedFd,
    dump_done: OwnedFd,
}

impl EventPair {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            dump_request: eventfd()?,
            dump_done: eventfd()?,
        })
    }

    #[inline]
    pub(crate) fn request_fd(&self) -> RawFd {
        self.dump_request.as_raw_fd()
    }

    #[inline]
    pub(crate) fn done_fd(&self) -> RawFd {
        self.dump_done.as_raw_fd()
    }

    /// The descriptors in the order the acknowledgment advertises them.
    #[inline]
    pub(crate) fn rights(&self) -> [RawFd; 2] {
        [self.request_fd(), self.done_fd()]
    }

    pub(crate) fn signal_done(&self) -> io::Result<()> {
        signal(self.done_fd())
    }
}

#[allow(unsafe_code)]
fn eventfd() -> io::Result<OwnedFd> {
    // SAFETY: syscall
    let ret = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: fresh descriptor owned by the caller
    Ok(unsafe { OwnedFd::from_raw_fd(ret) })
}

/// Signals an event by bumping its counter.
#[allow(unsafe_code)]
pub(crate) fn signal(fd: RawFd) -> io::Result<()> {
    let increment = 1u64.to_ne_bytes();

    loop {
        // SAFETY: syscall, increment outlives the call
        let written = unsafe { libc::write(fd, increment.as_ptr().cast(), increment.len()) };

        if written == increment.len() as isize {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            // a pegged counter is still a signaled event
            io::ErrorKind::WouldBlock => return Ok(()),
            _ => return Err(err),
        }
    }
}

/// Waits for an event to become signaled without consuming it,
/// `Ok(false)` on timeout.
pub(crate) fn wait(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    sys::poll_readable(fd, timeout)
}

#[cfg(test)]
mod test {
    use super::*;

    const POLL: Option<Duration> = Some(Duration::from_millis(20));

    #[test]
    fn pair_signals_independently() {
        let pair = EventPair::new().unwrap();

        assert!(!wait(pair.request_fd(), POLL).unwrap());
        assert!(!wait(pair.done_fd(), POLL).unwrap());

        signal(pair.request_fd()).unwrap();
        assert!(wait(pair.request_fd(), POLL).unwrap());
        assert!(!wait(pair.done_fd(), POLL).unwrap());

        pair.signal_done().unwrap();
        assert!(wait(pair.done_fd(), POLL).unwrap());
    }

    #[test]
    fn signaled_state_persists() {
        let pair = EventPair::new().unwrap();

        signal(pair.request_fd()).unwrap();

        // waiting must not reset the event, every observer sees it
        for _ in 0..3 {
            assert!(wait(pair.request_fd(), POLL).unwrap());
        }
    }

    #[test]
    fn double_signal_is_harmless() {
        let pair = EventPair::new().unwrap();

        signal(pair.done_fd()).unwrap();
        signal(pair.done_fd()).unwrap();

        assert!(wait(pair.done_fd(), POLL).unwrap());
    }
}
