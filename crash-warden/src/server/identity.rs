//! Verifies that a registering client is the process it claims to be.

use crate::{errors::Error, ipc::RESERVED_PID_FLOOR, sys};
use std::os::fd::OwnedFd;

pub(crate) struct VerifiedClient {
    /// The verified process id.
    pub pid: u32,
    /// Pidfd for exit supervision and capture, opened under the verified id.
    pub process: OwnedFd,
}

/// Checks the claimed process id against what the kernel says about the
/// connection, then opens the process for supervision.
///
/// The peer credentials recorded at connect time are authoritative; the
/// per-message credentials captured during the passcred window are the
/// fallback for transports that cannot answer the direct query. A claim that
/// matches neither is rejected, as is any id in the reserved range and any
/// process that cannot be opened with the access later capture needs.
pub(crate) fn verify(
    socket: &uds::nonblocking::UnixSeqpacketConn,
    message_creds: Option<&libc::ucred>,
    claimed_pid: u32,
) -> Result<VerifiedClient, Error> {
    if claimed_pid < RESERVED_PID_FLOOR {
        return Err(Error::ReservedProcessId { pid: claimed_pid });
    }

    let connection_pid = socket
        .initial_peer_credentials()
        .ok()
        .and_then(|creds| creds.pid())
        .map(std::num::NonZeroU32::get);

    let actual = match connection_pid {
        Some(pid) => pid,
        None => message_creds
            .map(|creds| creds.pid as u32)
            .ok_or(Error::UnknownClientPid)?,
    };

    if actual != claimed_pid {
        return Err(Error::ProcessIdMismatch {
            claimed: claimed_pid,
            actual,
        });
    }

    let process = sys::pidfd_open(claimed_pid).map_err(|source| Error::ProcessOpen {
        pid: claimed_pid,
        source,
    })?;

    Ok(VerifiedClient {
        pid: claimed_pid,
        process,
    })
}
