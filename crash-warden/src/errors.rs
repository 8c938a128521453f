#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the socket name is invalid")]
    InvalidName,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("message had an unrecognized protocol tag")]
    BadMagic,
    #[error("message was {received} bytes, expected {expected}")]
    WrongMessageSize { expected: usize, received: usize },
    #[error("process id {pid} is below the reserved floor")]
    ReservedProcessId { pid: u32 },
    #[error("claimed process id {claimed} does not match the connecting process id {actual}")]
    ProcessIdMismatch { claimed: u32, actual: u32 },
    #[error("registering client has an unknown or invalid pid")]
    UnknownClientPid,
    #[error("unable to open process {pid} for supervision")]
    ProcessOpen {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("the acknowledgment did not carry a usable handle pair")]
    MissingHandles,
    #[error("the connection was closed before the exchange completed")]
    ConnectionClosed,
    #[error("timed out talking to the server")]
    Timeout,
    #[error("a fault handler is already installed for this process")]
    HandlerAlreadyInstalled,
}
