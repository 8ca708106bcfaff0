use std::error;
use std::fmt;
use std::io;
use std::result;

#[derive(Debug)]
pub enum Error {
    /// Segment shorter than its fixed header, or a data offset that does not fit.
    MalformedSegment,
    /// Option list carried a kind byte we do not understand.
    UnknownOption(u8),
    /// Raw socket open, send or receive failed.
    Socket(io::Error),
    /// Peer set the DTH flag on its reply. Carries the reply payload.
    SessionTerminated(Vec<u8>),
    /// The dispatcher went away before the operation completed.
    Closed,

    Truncated,
    Unrecognized,
    Fragmented,
    UnknownProtocol,
    Checksum,
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::MalformedSegment => write!(f, "malformed tcp segment"),
            Error::UnknownOption(kind) => write!(f, "unknown tcp option kind {}", kind),
            Error::Socket(ref err) => write!(f, "raw socket error: {}", err),
            Error::SessionTerminated(_) => write!(f, "session terminated by peer (DTH)"),
            Error::Closed => write!(f, "connection closed"),
            Error::Truncated => write!(f, "truncated ipv4 datagram"),
            Error::Unrecognized => write!(f, "unrecognized ipv4 header"),
            Error::Fragmented => write!(f, "fragmented ipv4 datagram"),
            Error::UnknownProtocol => write!(f, "ipv4 datagram does not carry tcp"),
            Error::Checksum => write!(f, "invalid ipv4 header checksum"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Socket(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Socket(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Socket(err) => err,
            Error::Closed => io::Error::from(io::ErrorKind::NotConnected),
            Error::SessionTerminated(_) => io::Error::from(io::ErrorKind::ConnectionAborted),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
