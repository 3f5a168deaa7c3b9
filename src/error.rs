use std::fmt;
use std::io;

/// Errors crossing the IPC boundary.
///
/// Finalizers and response frames carry these as negative errno-style codes,
/// so every variant has a stable integer image via [`Error::code`].
#[derive(Debug)]
pub enum Error {
    /// Allocation failed; the operation was aborted with no partial indexing.
    NoMem,
    /// Malformed argument, e.g. a frame shorter than its header claims.
    Inval,
    /// The underlying transport failed.
    Transport(io::Error),
    /// The caller must retry later; returned by a hand-over exit while
    /// KEEPALIVE ports are still alive.
    TryAgain,
    /// A blocking wait was interrupted.
    Interrupted,
    /// The peer behind a port vanished while it was being serviced.
    ChildLost,
    /// The stream was reset; pending requests on the port are woken with
    /// this error.
    ConnReset,
    /// The transport does not implement the requested operation.
    NotSupported,
    /// The handle does not name a live transport object.
    BadHandle,
    /// No helper thread to act on.
    NoHelper,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Negative errno-style code, as written into finalizer exit codes and
    /// response retvals.
    pub fn code(&self) -> i32 {
        match self {
            Error::NoMem => -libc::ENOMEM,
            Error::Inval => -libc::EINVAL,
            Error::Transport(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            Error::TryAgain => -libc::EAGAIN,
            Error::Interrupted => -libc::EINTR,
            Error::ChildLost => -libc::ECHILD,
            Error::ConnReset => -libc::ECONNRESET,
            Error::NotSupported => -libc::EOPNOTSUPP,
            Error::BadHandle => -libc::EBADF,
            Error::NoHelper => -libc::ESRCH,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoMem => write!(fmt, "out of memory"),
            Error::Inval => write!(fmt, "invalid argument"),
            Error::Transport(err) => write!(fmt, "transport error: {}", err),
            Error::TryAgain => write!(fmt, "try again"),
            Error::Interrupted => write!(fmt, "interrupted"),
            Error::ChildLost => write!(fmt, "peer process lost"),
            Error::ConnReset => write!(fmt, "connection reset"),
            Error::NotSupported => write!(fmt, "not supported"),
            Error::BadHandle => write!(fmt, "bad handle"),
            Error::NoHelper => write!(fmt, "no helper thread"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::ConnectionReset => Error::ConnReset,
            io::ErrorKind::OutOfMemory => Error::NoMem,
            _ => Error::Transport(err),
        }
    }
}
