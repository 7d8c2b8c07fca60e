use std::{fmt, io};

use crate::types::ProtocolError;

/// All the ways the client can fail
///
/// Transport and protocol failures are not returned from individual
/// operations. They are delivered through the client's error channel while
/// the supervisor tears the connection down and reconnects. The variants
/// returned synchronously are the caller's own mistakes (invalid arguments,
/// state machine violations) plus request timeouts.
#[derive(Debug)]
pub enum Error {
    /// `connect` was called while a connection supervisor is already running
    AlreadyConnected,
    /// The client was permanently shut down with `dispose`
    AlreadyDisposed,
    /// An outbound payload is larger than the frame builder accepts
    ExceedsMaxPayload { tried: usize, limit: usize },
    /// An address string could not be parsed
    InvalidAddress(String),
    /// A header name or value contains bytes the block grammar cannot carry
    InvalidHeaders(String),
    /// An address used a scheme other than `nats://`
    InvalidNetworkScheme(String),
    /// The server sent a control line the parser does not recognize. Fatal
    /// to the connection cycle.
    InvalidServerControl(String),
    /// A subject string is empty or contains invalid characters
    InvalidSubject(String),
    /// The bytes following a payload were not `\r\n`. Fatal to the
    /// connection cycle.
    InvalidTerminator(Vec<u8>),
    /// An inbound frame announced a payload above the configured maximum.
    /// Fatal to the connection cycle.
    PayloadAboveMaximum { announced: usize, maximum: usize },
    /// An I/O failure on the socket
    Io(io::Error),
    /// The other side of a request or ping completion went away without
    /// answering (the client was disposed mid-flight)
    NoResponse,
    /// A request did not receive a reply within its timeout
    RequestTimeout,
    /// The server reported an error with `-ERR`
    ServerError(ProtocolError),
    /// The sid does not name a registered subscription
    UnknownSid(u64),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyConnected => write!(f, "already connected"),
            Error::AlreadyDisposed => write!(f, "already disposed"),
            Error::ExceedsMaxPayload { tried, limit } => {
                write!(f, "payload of {} bytes exceeds maximum {}", tried, limit)
            }
            Error::InvalidAddress(address) => write!(f, "invalid address {:?}", address),
            Error::InvalidHeaders(reason) => write!(f, "invalid headers: {}", reason),
            Error::InvalidNetworkScheme(scheme) => {
                write!(f, "invalid network scheme '{}'", scheme)
            }
            Error::InvalidServerControl(line) => write!(f, "invalid control line {:?}", line),
            Error::InvalidSubject(subject) => write!(f, "invalid subject {:?}", subject),
            Error::InvalidTerminator(terminator) => {
                write!(f, "invalid message terminator {:?}", terminator)
            }
            Error::PayloadAboveMaximum { announced, maximum } => {
                write!(
                    f,
                    "inbound payload of {} bytes exceeds maximum {}",
                    announced, maximum
                )
            }
            Error::Io(e) => write!(f, "{}", e),
            Error::NoResponse => write!(f, "no response"),
            Error::RequestTimeout => write!(f, "request timed out"),
            Error::ServerError(e) => write!(f, "server error: {}", e),
            Error::UnknownSid(sid) => write!(f, "unknown sid '{}'", sid),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
