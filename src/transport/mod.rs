use std::io;
use std::time::Duration;

pub use self::loopback::Loopback;
pub use self::unix::UnixTransport;

mod loopback;
mod unix;

/// Opaque transport handle naming one stream, server socket or wake event.
///
/// Handles are plain indexes into the transport's own table; the IPC core
/// never interprets them beyond equality.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub usize);

impl From<usize> for Handle {
    #[inline]
    fn from(val: usize) -> Handle {
        Handle(val)
    }
}

impl From<Handle> for usize {
    #[inline]
    fn from(val: Handle) -> usize {
        val.0
    }
}

/// Result of a stream attribute query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamAttrs {
    pub readable: bool,
    pub writable: bool,
    pub disconnected: bool,
}

/// The platform abstraction the IPC core runs on.
///
/// One transport instance owns a table of live objects; handles are only
/// meaningful against the transport that issued them. All methods are
/// callable from any thread.
///
/// `read` blocks until at least one byte is available, returning `Ok(0)` at
/// end of stream. `wait_any` blocks until one of `handles` is ready (a
/// stream readable or disconnected, a server accept pending, or an event
/// set) and returns that handle; interruption surfaces as
/// `ErrorKind::Interrupted`.
pub trait Transport: Send + Sync {
    /// Opens a stream (or binds a server socket) named by `uri`.
    fn open(&self, uri: &str) -> io::Result<Handle>;

    /// Closes a handle. Closing an unknown handle is a no-op.
    fn close(&self, handle: Handle);

    fn read(&self, handle: Handle, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, handle: Handle, buf: &[u8]) -> io::Result<usize>;

    fn wait_any(&self, handles: &[Handle], timeout: Option<Duration>) -> io::Result<Handle>;

    /// Accepts one pending client on a server handle.
    fn accept(&self, server: Handle) -> io::Result<Handle>;

    fn query_attrs(&self, handle: Handle) -> io::Result<StreamAttrs>;

    /// Creates a wake event that participates in `wait_any` like any other
    /// handle: ready while set, idle once cleared.
    fn create_event(&self) -> io::Result<Handle>;

    fn set_event(&self, handle: Handle) -> io::Result<()>;

    fn clear_event(&self, handle: Handle) -> io::Result<()>;
}
