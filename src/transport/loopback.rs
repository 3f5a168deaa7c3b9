use std::cmp;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use slab::Slab;

use super::{Handle, StreamAttrs, Transport};

/// In-process transport: streams are chunk queues between two handles of the
/// same `Loopback` instance.
///
/// Exists so that several `IpcCore` instances can exercise the full port
/// machinery inside one process, deterministically and without touching the
/// filesystem. Disconnection is reported only once buffered data has been
/// drained, so no frame sent before a close is ever lost.
///
/// URIs: `loop.srv:<name>` registers a named server, `loop:<name>` connects
/// to it. [`Loopback::stream_pair`] skips the server handshake.
pub struct Loopback {
    inner: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    objects: Slab<Node>,
    servers: HashMap<String, usize>,
}

struct StreamNode {
    /// Inbound chunks; writers push through their own `tx` clone of this.
    rx: Arc<ConcurrentQueue<Vec<u8>>>,
    /// Peer's inbound queue.
    tx: Option<Arc<ConcurrentQueue<Vec<u8>>>>,
    /// Partially consumed chunk.
    staged: Vec<u8>,
    peer: Option<usize>,
    peer_closed: bool,
}

struct ServerNode {
    name: String,
    backlog: VecDeque<usize>,
}

enum Node {
    Stream(StreamNode),
    Server(ServerNode),
    Event(bool),
}

fn bad_handle() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

impl Inner {
    fn stream_mut(&mut self, handle: Handle) -> io::Result<&mut StreamNode> {
        match self.objects.get_mut(handle.0) {
            Some(Node::Stream(s)) => Ok(s),
            _ => Err(bad_handle()),
        }
    }

    fn new_stream_pair(&mut self) -> (usize, usize) {
        let rx_a = Arc::new(ConcurrentQueue::unbounded());
        let rx_b = Arc::new(ConcurrentQueue::unbounded());

        let a = self.objects.insert(Node::Stream(StreamNode {
            rx: rx_a.clone(),
            tx: Some(rx_b.clone()),
            staged: Vec::new(),
            peer: None,
            peer_closed: false,
        }));
        let b = self.objects.insert(Node::Stream(StreamNode {
            rx: rx_b,
            tx: Some(rx_a),
            staged: Vec::new(),
            peer: None,
            peer_closed: false,
        }));

        if let Some(Node::Stream(s)) = self.objects.get_mut(a) {
            s.peer = Some(b);
        }
        if let Some(Node::Stream(s)) = self.objects.get_mut(b) {
            s.peer = Some(a);
        }

        (a, b)
    }

    fn ready(&self, handle: Handle) -> bool {
        match self.objects.get(handle.0) {
            Some(Node::Stream(s)) => {
                !s.staged.is_empty() || !s.rx.is_empty() || s.peer_closed
            }
            Some(Node::Server(s)) => !s.backlog.is_empty(),
            Some(Node::Event(set)) => *set,
            // Closed underneath the waiter: report ready so it gets culled.
            None => true,
        }
    }
}

impl Loopback {
    pub fn new() -> Loopback {
        Loopback {
            inner: Mutex::new(Inner {
                objects: Slab::new(),
                servers: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Connected stream pair without a named server.
    pub fn stream_pair(&self) -> (Handle, Handle) {
        let mut inner = self.inner.lock().unwrap();
        let (a, b) = inner.new_stream_pair();
        (Handle(a), Handle(b))
    }

    fn notify(&self) {
        let _inner = self.inner.lock().unwrap();
        self.cond.notify_all();
    }
}

impl Default for Loopback {
    fn default() -> Loopback {
        Loopback::new()
    }
}

impl Transport for Loopback {
    fn open(&self, uri: &str) -> io::Result<Handle> {
        if let Some(name) = uri.strip_prefix("loop.srv:") {
            let mut inner = self.inner.lock().unwrap();
            if inner.servers.contains_key(name) {
                return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
            }

            let idx = inner.objects.insert(Node::Server(ServerNode {
                name: name.to_owned(),
                backlog: VecDeque::new(),
            }));
            inner.servers.insert(name.to_owned(), idx);
            return Ok(Handle(idx));
        }

        if let Some(name) = uri.strip_prefix("loop:") {
            let mut inner = self.inner.lock().unwrap();
            let server = match inner.servers.get(name) {
                Some(&idx) => idx,
                None => return Err(io::Error::from_raw_os_error(libc::ECONNREFUSED)),
            };

            let (client, serverside) = inner.new_stream_pair();
            match inner.objects.get_mut(server) {
                Some(Node::Server(s)) => s.backlog.push_back(serverside),
                _ => return Err(io::Error::from_raw_os_error(libc::ECONNREFUSED)),
            }

            self.cond.notify_all();
            return Ok(Handle(client));
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported uri: {}", uri),
        ))
    }

    fn close(&self, handle: Handle) {
        let mut inner = self.inner.lock().unwrap();

        if !inner.objects.contains(handle.0) {
            return;
        }

        match inner.objects.remove(handle.0) {
            Node::Stream(s) => {
                if let Some(peer) = s.peer {
                    if let Some(Node::Stream(p)) = inner.objects.get_mut(peer) {
                        p.peer_closed = true;
                        p.tx = None;
                    }
                }
            }
            Node::Server(s) => {
                inner.servers.remove(&s.name);
                for pending in s.backlog {
                    let client = match inner.objects.get(pending) {
                        Some(Node::Stream(p)) => p.peer,
                        _ => None,
                    };
                    if let Some(client) = client {
                        if let Some(Node::Stream(c)) = inner.objects.get_mut(client) {
                            c.peer_closed = true;
                            c.tx = None;
                        }
                    }
                    inner.objects.remove(pending);
                }
            }
            Node::Event(_) => {}
        }

        self.cond.notify_all();
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock().unwrap();

        loop {
            let stream = inner.stream_mut(handle)?;

            if stream.staged.is_empty() {
                if let Ok(chunk) = stream.rx.pop() {
                    stream.staged = chunk;
                }
            }

            if !stream.staged.is_empty() {
                let n = cmp::min(buf.len(), stream.staged.len());
                buf[..n].copy_from_slice(&stream.staged[..n]);
                stream.staged.drain(..n);
                return Ok(n);
            }

            if stream.peer_closed {
                return Ok(0);
            }

            inner = self.cond.wait(inner).unwrap();
        }
    }

    fn write(&self, handle: Handle, buf: &[u8]) -> io::Result<usize> {
        let tx = {
            let mut inner = self.inner.lock().unwrap();
            let stream = inner.stream_mut(handle)?;

            if stream.peer_closed {
                return Err(io::Error::from_raw_os_error(libc::EPIPE));
            }

            match &stream.tx {
                Some(tx) => tx.clone(),
                None => return Err(io::Error::from_raw_os_error(libc::EPIPE)),
            }
        };

        if tx.push(buf.to_vec()).is_err() {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }

        self.notify();
        Ok(buf.len())
    }

    fn wait_any(&self, handles: &[Handle], timeout: Option<Duration>) -> io::Result<Handle> {
        let deadline = timeout.map(|to| Instant::now() + to);
        let mut inner = self.inner.lock().unwrap();

        loop {
            for &handle in handles {
                if inner.ready(handle) {
                    return Ok(handle);
                }
            }

            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                    self.cond.wait_timeout(inner, deadline - now).unwrap().0
                }
                None => self.cond.wait(inner).unwrap(),
            };
        }
    }

    fn accept(&self, server: Handle) -> io::Result<Handle> {
        let mut inner = self.inner.lock().unwrap();

        match inner.objects.get_mut(server.0) {
            Some(Node::Server(s)) => match s.backlog.pop_front() {
                Some(idx) => Ok(Handle(idx)),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            },
            _ => Err(bad_handle()),
        }
    }

    fn query_attrs(&self, handle: Handle) -> io::Result<StreamAttrs> {
        let inner = self.inner.lock().unwrap();

        match inner.objects.get(handle.0) {
            Some(Node::Stream(s)) => {
                let readable = !s.staged.is_empty() || !s.rx.is_empty();
                Ok(StreamAttrs {
                    readable,
                    writable: !s.peer_closed,
                    disconnected: s.peer_closed && !readable,
                })
            }
            Some(Node::Server(s)) => Ok(StreamAttrs {
                readable: !s.backlog.is_empty(),
                writable: false,
                disconnected: false,
            }),
            Some(Node::Event(set)) => Ok(StreamAttrs {
                readable: *set,
                writable: false,
                disconnected: false,
            }),
            None => Err(bad_handle()),
        }
    }

    fn create_event(&self) -> io::Result<Handle> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Handle(inner.objects.insert(Node::Event(false))))
    }

    fn set_event(&self, handle: Handle) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.objects.get_mut(handle.0) {
            Some(Node::Event(set)) => {
                *set = true;
                self.cond.notify_all();
                Ok(())
            }
            _ => Err(bad_handle()),
        }
    }

    fn clear_event(&self, handle: Handle) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.objects.get_mut(handle.0) {
            Some(Node::Event(set)) => {
                *set = false;
                Ok(())
            }
            _ => Err(bad_handle()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn pair_round_trip() {
        let transport = Loopback::new();
        let (a, b) = transport.stream_pair();

        assert_eq!(transport.write(a, b"ping").unwrap(), 4);

        let mut buf = [0u8; 16];
        let n = transport.read(b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn chunked_reads_preserve_bytes() {
        let transport = Loopback::new();
        let (a, b) = transport.stream_pair();

        transport.write(a, b"abcdef").unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 2];
        for _ in 0..3 {
            let n = transport.read(b, &mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn drain_before_disconnect() {
        let transport = Loopback::new();
        let (a, b) = transport.stream_pair();

        transport.write(a, b"last words").unwrap();
        transport.close(a);

        let attrs = transport.query_attrs(b).unwrap();
        assert!(attrs.readable);
        assert!(!attrs.disconnected);

        let mut buf = [0u8; 32];
        let n = transport.read(b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"last words");

        let attrs = transport.query_attrs(b).unwrap();
        assert!(attrs.disconnected);
        assert_eq!(transport.read(b, &mut buf).unwrap(), 0);
    }

    #[test]
    fn named_server_accept() {
        let transport = Loopback::new();
        let server = transport.open("loop.srv:alpha").unwrap();

        assert!(transport.open("loop:beta").is_err());

        let client = transport.open("loop:alpha").unwrap();
        let accepted = transport.accept(server).unwrap();

        transport.write(client, b"hi").unwrap();
        let mut buf = [0u8; 4];
        let n = transport.read(accepted, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[test]
    fn wait_any_wakes_on_event() {
        let transport = Arc::new(Loopback::new());
        let event = transport.create_event().unwrap();

        let setter = transport.clone();
        let th = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set_event(event).unwrap();
        });

        let polled = transport.wait_any(&[event], None).unwrap();
        assert_eq!(polled, event);

        transport.clear_event(event).unwrap();
        assert!(transport
            .wait_any(&[event], Some(Duration::from_millis(10)))
            .is_err());

        th.join().unwrap();
    }
}
