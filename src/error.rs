//! Error type for the whole crate.
//!
//! One enum covers everything from call-sign validation to TCP faults, so
//! that a single transport error can be cloned and fanned out to every
//! connection sharing the socket. `code()` gives the classic POSIX-style
//! name that terminal programs like to print.

use crate::call::Addr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid call sign {call:?}: {reason}")]
    BadCallSign { call: String, reason: &'static str },

    #[error("invalid TNC port {0}")]
    BadPort(usize),

    #[error("digipeater path has {0} entries, max 8")]
    ViaTooLong(usize),

    /// The TNC answered an 'X' registration with a failure byte.
    #[error("TNC refused to register {call} on port {port}")]
    RegistrationRefused { port: u8, call: Addr },

    #[error("TNC has no port {0}")]
    NoSuchPort(u8),

    #[error("TNC advertised no ports")]
    NoPorts,

    /// An outbound connect re-used a (port, local, remote) triple that is
    /// already active.
    #[error("connection {0} already exists")]
    AddrInUse(String),

    /// The AGWPE byte stream or an AX.25 packet could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Inbound data arrived faster than the application read it.
    #[error("receive buffer overflow")]
    RecvOverflow,

    /// Inbound data arrived after the local side closed the session.
    #[error("data received after local close")]
    RecvAfterClose,

    /// The remote station disconnected (or never accepted the connection).
    #[error("link disconnected")]
    Disconnected,

    /// The server (or its TCP socket) is gone.
    #[error("server closed")]
    Closed,

    #[error("I/O error: {msg}")]
    Io {
        kind: std::io::ErrorKind,
        msg: String,
    },
}

impl Error {
    /// POSIX-style code name, mostly useful for log lines and tests.
    #[must_use]
    pub fn code(&self) -> &'static str {
        use std::io::ErrorKind;
        match self {
            Error::BadCallSign { .. } | Error::BadPort(_) | Error::ViaTooLong(_) => "EINVAL",
            Error::RegistrationRefused { .. } => "EACCES",
            Error::NoSuchPort(_) | Error::NoPorts => "ENOENT",
            Error::AddrInUse(_) => "EADDRINUSE",
            Error::Protocol(_) | Error::RecvAfterClose => "EPROTO",
            Error::RecvOverflow => "ENOBUFS",
            Error::Disconnected => "ECONNRESET",
            Error::Closed => "ESHUTDOWN",
            Error::Io { kind, .. } => match kind {
                ErrorKind::ConnectionRefused => "ECONNREFUSED",
                ErrorKind::ConnectionReset => "ECONNRESET",
                ErrorKind::ConnectionAborted => "ECONNABORTED",
                ErrorKind::TimedOut => "ETIMEDOUT",
                ErrorKind::BrokenPipe => "EPIPE",
                ErrorKind::UnexpectedEof => "EPIPE",
                _ => "EIO",
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            kind: e.kind(),
            msg: e.to_string(),
        }
    }
}
