use std::fmt::{Debug, Display};
use std::{fmt, io, result};
use std::sync::PoisonError;

#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

#[derive(Debug)]
pub enum ErrorKind {
    /// An allocation was refused. Always recoverable; the operation that hit
    /// it must have rolled back any partial state.
    OutOfMemory,
    /// Malformed or unsupported bus address.
    BadAddress(String),
    /// The address was understood but the peer is unreachable.
    DidNotConnect(String),
    /// Peer identity mismatch, GUID mismatch, or predicate rejection.
    AuthFailed(String),
    /// The message loader declared the byte stream corrupt.
    CorruptedStream,
    ClosedError,
    Timeout,
    PoisonError,
    StringError(String),
    IOError(io::Error),
    YAMLError(serde_yaml::Error),
    UTF8Error(std::str::Utf8Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn out_of_memory() -> Self {
        Error {
            err: Box::new(ErrorKind::OutOfMemory),
        }
    }

    pub fn bad_address<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::BadAddress(s.to_string())),
        }
    }

    pub fn did_not_connect<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::DidNotConnect(s.to_string())),
        }
    }

    pub fn auth_failed<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::AuthFailed(s.to_string())),
        }
    }

    pub fn corrupted() -> Self {
        Error {
            err: Box::new(ErrorKind::CorruptedStream),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::ClosedError),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// True if this error is the recoverable out-of-memory kind.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(&*self.err, ErrorKind::OutOfMemory)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::YAMLError(err)),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error {
            err: Box::new(ErrorKind::UTF8Error(err)),
        }
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error {
            err: Box::new(ErrorKind::PoisonError),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        std::fmt::Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::OutOfMemory => f.write_str("not enough memory to complete this operation"),
            ErrorKind::BadAddress(s) => write!(f, "bad address: {}", s),
            ErrorKind::DidNotConnect(s) => write!(f, "could not connect: {}", s),
            ErrorKind::AuthFailed(s) => write!(f, "authentication failed: {}", s),
            ErrorKind::CorruptedStream => f.write_str("corrupted message stream"),
            ErrorKind::ClosedError => f.write_str("socket/file is closed"),
            ErrorKind::Timeout => f.write_str("operation timed out"),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::StringError(s) => f.write_str(&s),
            ErrorKind::IOError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::YAMLError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::UTF8Error(e) => std::fmt::Display::fmt(&e, f),
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ErrorKind {}
