use crate::Error;

/// A socket name.
///
/// A file path can always be used as the name for the socket. Additionally,
/// a plain string will be used as an abstract name. See
/// [here](https://man7.org/linux/man-pages/man7/unix.7.html) for more details
/// on abstract namespace sockets.
///
/// Abstract names are preferred for this protocol since they need no
/// filesystem cleanup when the server exits.
pub enum SocketName<'scope> {
    Path(&'scope std::path::Path),
    Abstract(&'scope str),
}

impl<'scope> From<&'scope std::path::Path> for SocketName<'scope> {
    fn from(s: &'scope std::path::Path) -> Self {
        Self::Path(s)
    }
}

impl<'scope> From<&'scope str> for SocketName<'scope> {
    fn from(s: &'scope str) -> Self {
        Self::Abstract(s)
    }
}

impl<'scope> From<&'scope String> for SocketName<'scope> {
    fn from(s: &'scope String) -> Self {
        Self::from(s.as_str())
    }
}

/// An owned socket name, for the cases where the name has to outlive the
/// caller that provided it, eg. the background registration thread.
pub(crate) enum OwnedSocketName {
    Path(std::path::PathBuf),
    Abstract(String),
}

impl OwnedSocketName {
    pub(crate) fn as_name(&self) -> SocketName<'_> {
        match self {
            Self::Path(path) => SocketName::Path(path),
            Self::Abstract(name) => SocketName::Abstract(name),
        }
    }
}

impl<'scope> From<SocketName<'scope>> for OwnedSocketName {
    fn from(s: SocketName<'scope>) -> Self {
        match s {
            SocketName::Path(path) => Self::Path(path.to_path_buf()),
            SocketName::Abstract(name) => Self::Abstract(name.to_owned()),
        }
    }
}

pub(crate) fn socket_addr(name: &SocketName<'_>) -> Result<uds::UnixSocketAddr, Error> {
    match name {
        SocketName::Path(path) => {
            uds::UnixSocketAddr::from_path(path).map_err(|_err| Error::InvalidName)
        }
        SocketName::Abstract(name) => {
            uds::UnixSocketAddr::from_abstract(name).map_err(|_err| Error::InvalidName)
        }
    }
}

/// Process ids below this value belong to the kernel or to system bootstrap
/// and are never accepted from a registering client.
pub const RESERVED_PID_FLOOR: u32 = 5;

/// The one request the protocol knows, sent exactly once per client over a
/// fresh connection.
///
/// All fields are in native byte order, both halves of the exchange run on
/// the same machine.
#[derive(Copy, Clone)]
#[cfg_attr(test, derive(PartialEq, Debug))]
#[repr(C)]
pub struct RegistrationRequest {
    /// Must be [`Self::MAGIC`], anything else is rejected outright.
    pub magic: [u8; 8],
    /// The process id the client claims to be. Verified against the socket
    /// peer credentials before anything else happens.
    pub process_id: u32,
    /// The thread the client registered from.
    pub thread_id: u32,
    /// Address inside the client where its fault block will live. Only ever
    /// meaningful to the client itself and to a debugger-style capture step,
    /// the server never dereferences it.
    pub fault_context: u64,
}

impl RegistrationRequest {
    pub const MAGIC: [u8; 8] = *b"CWDNREG1";

    pub fn new(process_id: u32, thread_id: u32, fault_context: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            process_id,
            thread_id,
            fault_context,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        #[allow(unsafe_code)]
        unsafe {
            let size = std::mem::size_of::<Self>();
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, size)
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != std::mem::size_of::<Self>() {
            return None;
        }

        #[allow(unsafe_code)]
        unsafe {
            Some(std::ptr::read_unaligned(buf.as_ptr().cast::<Self>()))
        }
    }
}

/// The server's reply to a valid [`RegistrationRequest`], sent exactly once,
/// only after the client's identity has been verified.
///
/// The actual dump-request and dump-done descriptors ride along as ancillary
/// `SCM_RIGHTS` data on the same message; the two handle fields are indices
/// into that descriptor array. The client must receive both descriptors or
/// treat the whole registration as failed.
#[derive(Copy, Clone)]
#[cfg_attr(test, derive(PartialEq, Debug))]
#[repr(C)]
pub struct RegistrationAck {
    /// Must be [`Self::MAGIC`].
    pub magic: [u8; 8],
    /// Index of the dump-request descriptor in the rights array. The client
    /// signals this one from its fault handler.
    pub dump_request_handle: u64,
    /// Index of the dump-done descriptor in the rights array. The client
    /// blocks on this one until the capture step has finished.
    pub dump_done_handle: u64,
}

impl RegistrationAck {
    pub const MAGIC: [u8; 8] = *b"CWDNACK1";

    pub fn new(dump_request_handle: u64, dump_done_handle: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            dump_request_handle,
            dump_done_handle,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        #[allow(unsafe_code)]
        unsafe {
            let size = std::mem::size_of::<Self>();
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, size)
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != std::mem::size_of::<Self>() {
            return None;
        }

        #[allow(unsafe_code)]
        unsafe {
            Some(std::ptr::read_unaligned(buf.as_ptr().cast::<Self>()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::{RegistrationAck, RegistrationRequest};

    #[test]
    fn request_bytes() {
        assert_eq!(std::mem::size_of::<RegistrationRequest>(), 24);

        let expected = RegistrationRequest::new(9999, 10001, 0xdead_beef_cafe);
        let exp_bytes = expected.as_bytes();

        let actual = RegistrationRequest::from_bytes(exp_bytes).unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn ack_bytes() {
        assert_eq!(std::mem::size_of::<RegistrationAck>(), 24);

        let expected = RegistrationAck::new(0, 1);
        let exp_bytes = expected.as_bytes();

        let actual = RegistrationAck::from_bytes(exp_bytes).unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn rejects_truncated() {
        let full = RegistrationRequest::new(9999, 10001, 0);
        let bytes = full.as_bytes();

        assert!(RegistrationRequest::from_bytes(&bytes[..bytes.len() - 1]).is_none());
        assert!(RegistrationAck::from_bytes(&[0u8; 32]).is_none());
    }
}
