use std::cmp;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slab::Slab;

use super::{Handle, StreamAttrs, Transport};

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* )) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Wake event backed by an eventfd, created non-blocking so that setting an
/// already-set event and clearing an idle one are both no-ops.
#[derive(Debug)]
struct EventFd {
    inner: OwnedFd,
}

impl EventFd {
    fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(EventFd {
            inner: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn set(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();

        match syscall!(write(
            self.inner.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn clear(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];

        match syscall!(read(
            self.inner.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

enum Entry {
    Stream(Arc<UnixStream>),
    Server(Arc<UnixListener>),
    Event(Arc<EventFd>),
}

impl Entry {
    fn raw_fd(&self) -> RawFd {
        match self {
            Entry::Stream(s) => s.as_raw_fd(),
            Entry::Server(s) => s.as_raw_fd(),
            Entry::Event(e) => e.as_raw_fd(),
        }
    }
}

/// Transport over Unix-domain sockets with eventfd wake events.
///
/// URIs: `unix:<path>` connects a stream, `unix.srv:<path>` binds a server
/// socket (unlinking any stale socket file first). `wait_any` is a plain
/// poll(2) over the raw descriptors of the watched handles.
pub struct UnixTransport {
    objects: Mutex<Slab<Entry>>,
}

impl UnixTransport {
    pub fn new() -> UnixTransport {
        UnixTransport {
            objects: Mutex::new(Slab::new()),
        }
    }

    fn insert(&self, entry: Entry) -> Handle {
        Handle(self.objects.lock().unwrap().insert(entry))
    }

    fn entry(&self, handle: Handle) -> io::Result<Entry> {
        let objects = self.objects.lock().unwrap();

        match objects.get(handle.0) {
            Some(Entry::Stream(s)) => Ok(Entry::Stream(s.clone())),
            Some(Entry::Server(s)) => Ok(Entry::Server(s.clone())),
            Some(Entry::Event(e)) => Ok(Entry::Event(e.clone())),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    fn stream(&self, handle: Handle) -> io::Result<Arc<UnixStream>> {
        match self.entry(handle)? {
            Entry::Stream(s) => Ok(s),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    /// Registers an already-connected stream, e.g. one inherited from the
    /// parent process across fork/exec.
    pub fn adopt_stream(&self, stream: UnixStream) -> Handle {
        self.insert(Entry::Stream(Arc::new(stream)))
    }

    /// Connected stream pair, both ends registered with this transport.
    pub fn stream_pair(&self) -> io::Result<(Handle, Handle)> {
        let (a, b) = UnixStream::pair()?;

        Ok((
            self.insert(Entry::Stream(Arc::new(a))),
            self.insert(Entry::Stream(Arc::new(b))),
        ))
    }
}

impl Default for UnixTransport {
    fn default() -> UnixTransport {
        UnixTransport::new()
    }
}

impl Transport for UnixTransport {
    fn open(&self, uri: &str) -> io::Result<Handle> {
        if let Some(path) = uri.strip_prefix("unix.srv:") {
            let _ = fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            return Ok(self.insert(Entry::Server(Arc::new(listener))));
        }

        if let Some(path) = uri.strip_prefix("unix:") {
            let stream = UnixStream::connect(path)?;
            return Ok(self.insert(Entry::Stream(Arc::new(stream))));
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported uri: {}", uri),
        ))
    }

    fn close(&self, handle: Handle) {
        let mut objects = self.objects.lock().unwrap();

        if objects.contains(handle.0) {
            objects.remove(handle.0);
        }
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream(handle)?;
        (&*stream).read(buf)
    }

    fn write(&self, handle: Handle, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream(handle)?;
        (&*stream).write(buf)
    }

    fn wait_any(&self, handles: &[Handle], timeout: Option<Duration>) -> io::Result<Handle> {
        let mut fds = Vec::with_capacity(handles.len());

        {
            let objects = self.objects.lock().unwrap();

            for &handle in handles {
                // A handle closed since the caller snapshotted its watch-set
                // is reported ready so the caller re-queries and culls it.
                let fd = match objects.get(handle.0) {
                    Some(entry) => entry.raw_fd(),
                    None => return Ok(handle),
                };

                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN | libc::POLLRDHUP,
                    revents: 0,
                });
            }
        }

        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let cnt = syscall!(poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout))?;

        if cnt == 0 {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }

        for (i, fd) in fds.iter().enumerate() {
            if fd.revents != 0 {
                return Ok(handles[i]);
            }
        }

        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    fn accept(&self, server: Handle) -> io::Result<Handle> {
        let listener = match self.entry(server)? {
            Entry::Server(s) => s,
            _ => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };

        let (stream, _addr) = listener.accept()?;
        Ok(self.insert(Entry::Stream(Arc::new(stream))))
    }

    fn query_attrs(&self, handle: Handle) -> io::Result<StreamAttrs> {
        let fd = match self.entry(handle)? {
            Entry::Stream(s) => s.as_raw_fd(),
            Entry::Server(s) => s.as_raw_fd(),
            Entry::Event(e) => e.as_raw_fd(),
        };

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN | libc::POLLOUT | libc::POLLRDHUP,
            revents: 0,
        };

        syscall!(poll(&mut pfd, 1, 0))?;

        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        Ok(StreamAttrs {
            readable: pfd.revents & libc::POLLIN != 0,
            writable: pfd.revents & libc::POLLOUT != 0,
            disconnected: pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLRDHUP) != 0,
        })
    }

    fn create_event(&self) -> io::Result<Handle> {
        let event = EventFd::new()?;
        Ok(self.insert(Entry::Event(Arc::new(event))))
    }

    fn set_event(&self, handle: Handle) -> io::Result<()> {
        match self.entry(handle)? {
            Entry::Event(e) => e.set(),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    fn clear_event(&self, handle: Handle) -> io::Result<()> {
        match self.entry(handle)? {
            Entry::Event(e) => e.clear(),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_set_clear() {
        let transport = UnixTransport::new();
        let event = transport.create_event().unwrap();

        transport.set_event(event).unwrap();
        transport.set_event(event).unwrap();

        let polled = transport
            .wait_any(&[event], Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(polled, event);

        transport.clear_event(event).unwrap();
        assert!(transport
            .wait_any(&[event], Some(Duration::from_millis(10)))
            .is_err());

        // clearing an idle event must not block
        transport.clear_event(event).unwrap();
    }

    #[test]
    fn stream_pair_round_trip() {
        let transport = UnixTransport::new();
        let (a, b) = transport.stream_pair().unwrap();

        assert_eq!(transport.write(a, b"ping").unwrap(), 4);

        let polled = transport
            .wait_any(&[b], Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(polled, b);

        let mut buf = [0u8; 16];
        let n = transport.read(b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn disconnect_reported() {
        let transport = UnixTransport::new();
        let (a, b) = transport.stream_pair().unwrap();

        transport.close(a);

        let attrs = transport.query_attrs(b).unwrap();
        assert!(attrs.disconnected);
    }

    #[test]
    fn server_accepts_client() {
        let dir = std::env::temp_dir().join(format!("libos-ipc-ut-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("srv.sock");
        let uri = format!("unix.srv:{}", path.display());

        let transport = UnixTransport::new();
        let server = transport.open(&uri).unwrap();

        let client = transport.open(&format!("unix:{}", path.display())).unwrap();

        let polled = transport
            .wait_any(&[server], Some(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(polled, server);

        let accepted = transport.accept(server).unwrap();
        transport.write(client, b"hi").unwrap();

        let mut buf = [0u8; 4];
        let n = transport.read(accepted, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");

        let _ = std::fs::remove_file(&path);
    }
}
