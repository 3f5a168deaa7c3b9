use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::callback::{CallbackTable, RESPONSE_CALLBACK};
use crate::error::{Error, Result};
use crate::frame::{self, Header, Message, HEADER_SIZE, RECV_READAHEAD};
use crate::helper::Lifecycle;
use crate::port::{Finalizer, Port};
use crate::port_type::PortType;
use crate::registry::Registry;
use crate::transport::{Handle, Transport};
use crate::PeerId;

/// The IPC core of one library-OS instance.
///
/// Owns the port registry, the callback table, the lifecycle of the helper
/// thread and the transport it all runs on. Cloning is cheap and every clone
/// refers to the same instance; any thread may call into it, while exactly
/// one helper thread runs the poll loop.
#[derive(Clone)]
pub struct IpcCore {
    pub(crate) inner: Arc<CoreInner>,
}

pub(crate) struct CoreInner {
    pub transport: Arc<dyn Transport>,
    pub registry: Registry,
    pub callbacks: CallbackTable,
    pub lifecycle: Lifecycle,
    pub vmid: PeerId,
    seq: AtomicU64,
}

/// One well-known endpoint handed to [`IpcCore::init_ports`]: the peer it
/// belongs to plus either a live handle or a URI to open.
pub struct Endpoint {
    peer: PeerId,
    source: EndpointSource,
}

enum EndpointSource {
    Handle(Handle),
    Uri(String),
}

impl Endpoint {
    pub fn handle(peer: PeerId, handle: Handle) -> Endpoint {
        Endpoint {
            peer,
            source: EndpointSource::Handle(handle),
        }
    }

    pub fn uri<S: Into<String>>(peer: PeerId, uri: S) -> Endpoint {
        Endpoint {
            peer,
            source: EndpointSource::Uri(uri.into()),
        }
    }
}

/// The well-known ports bootstrapped at startup: the instance's own server
/// socket, the stream to its parent, the two namespace leaders, and an
/// optional broadcast stream shared by every instance.
#[derive(Default)]
pub struct BootstrapPorts {
    pub self_server: Option<Endpoint>,
    pub parent: Option<Endpoint>,
    pub pid_leader: Option<Endpoint>,
    pub sysv_leader: Option<Endpoint>,
    pub broadcast: Option<Endpoint>,
}

impl IpcCore {
    pub fn new(
        transport: Arc<dyn Transport>,
        vmid: PeerId,
        mut callbacks: CallbackTable,
    ) -> IpcCore {
        callbacks.install_response_handler();

        IpcCore {
            inner: Arc::new(CoreInner {
                transport,
                registry: Registry::new(),
                callbacks,
                lifecycle: Lifecycle::new(),
                vmid,
                seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn vmid(&self) -> PeerId {
        self.inner.vmid
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// A fresh message stamped with this instance as the source.
    pub fn message(&self, code: u32, dst: PeerId, body: Vec<u8>) -> Message {
        Message::new(code, self.inner.vmid, dst, body)
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn resolve(&self, source: EndpointSource) -> Result<Handle> {
        match source {
            EndpointSource::Handle(handle) => Ok(handle),
            EndpointSource::Uri(uri) => {
                debug!("opening bootstrap port {}", uri);
                Ok(self.inner.transport.open(&uri)?)
            }
        }
    }

    /// Bootstraps the well-known ports.
    ///
    /// The broadcast stream, if present, is recorded as the distinguished
    /// broadcast port with a finalizer that clears that slot when the
    /// stream goes away.
    pub fn init_ports(&self, boot: BootstrapPorts) -> Result<()> {
        if let Some(ep) = boot.self_server {
            let handle = self.resolve(ep.source)?;
            self.add_port_by_id(
                self.norm_peer(ep.peer),
                handle,
                PortType::server() | PortType::pollable(),
                None,
            );
        }

        if let Some(ep) = boot.parent {
            let handle = self.resolve(ep.source)?;
            self.add_port_by_id(
                self.norm_peer(ep.peer),
                handle,
                PortType::direct_parent() | PortType::listen() | PortType::pollable(),
                None,
            );
        }

        if let Some(ep) = boot.pid_leader {
            let handle = self.resolve(ep.source)?;
            self.add_port_by_id(
                self.norm_peer(ep.peer),
                handle,
                PortType::pid_leader() | PortType::listen() | PortType::pollable(),
                None,
            );
        }

        if let Some(ep) = boot.sysv_leader {
            let handle = self.resolve(ep.source)?;
            self.add_port_by_id(
                self.norm_peer(ep.peer),
                handle,
                PortType::sysv_leader() | PortType::listen() | PortType::pollable(),
                None,
            );
        }

        if let Some(ep) = boot.broadcast {
            let handle = self.resolve(ep.source)?;

            let weak = Arc::downgrade(&self.inner);
            let fini: Finalizer = Arc::new(move |port, _peer, _code| {
                if let Some(inner) = weak.upgrade() {
                    inner.registry.clear_broadcast(port);
                }
            });

            let port = self.add_port_by_id(
                self.norm_peer(ep.peer),
                handle,
                PortType::listen() | PortType::pollable(),
                Some(fini),
            );
            self.inner.registry.set_broadcast(port);
        }

        Ok(())
    }

    /// A bootstrap entry naming this instance itself is indexed as
    /// peer-unknown, like any port that is not yet bound to a remote.
    fn norm_peer(&self, peer: PeerId) -> PeerId {
        if peer == self.inner.vmid {
            0
        } else {
            peer
        }
    }

    /// Registers (or reclassifies) an existing port.
    pub fn add_port(
        &self,
        port: &Arc<Port>,
        peer: PeerId,
        ty: PortType,
        fini: Option<Finalizer>,
    ) {
        debug_assert!(peer != self.inner.vmid);

        if self.inner.registry.add_port(port, peer, ty, fini) {
            self.restart_helper(true);
        }
    }

    /// Registers a transport handle under `(peer, ty)`, reusing the port
    /// already wrapping it if one exists.
    pub fn add_port_by_id(
        &self,
        peer: PeerId,
        handle: Handle,
        ty: PortType,
        fini: Option<Finalizer>,
    ) -> Arc<Port> {
        let (port, need_restart) =
            self.inner
                .registry
                .add_port_by_id(&self.inner.transport, peer, handle, ty, fini);

        if need_restart {
            self.restart_helper(true);
        }
        port
    }

    /// Deregisters `ty` from `port` (everything when `ty` is empty).
    pub fn del_port(&self, port: &Arc<Port>, ty: PortType) {
        if self.inner.registry.del_port(port, ty) {
            self.restart_helper(false);
        }
    }

    pub fn del_port_by_id(&self, peer: PeerId, ty: PortType) {
        if self.inner.registry.del_port_by_id(peer, ty) {
            self.restart_helper(false);
        }
    }

    pub fn del_all_ports(&self, ty: PortType) {
        if self.inner.registry.del_all(ty) {
            self.restart_helper(false);
        }
    }

    /// Fully removes `port`, runs its finalizers once with `exit_code` and
    /// wakes its pending requests with a connection-reset result.
    pub fn del_port_final(&self, port: &Arc<Port>, exit_code: i32) {
        if self.inner.registry.del_port_final(port, exit_code) {
            self.restart_helper(false);
        }
    }

    pub fn lookup_port(&self, peer: PeerId, ty: PortType) -> Option<Arc<Port>> {
        self.inner.registry.lookup_port(peer, ty)
    }

    /// The distinguished broadcast port, if one is alive. The reference is
    /// taken under the registry lock, so a concurrent teardown can at worst
    /// leave the caller with a port whose send will fail cleanly.
    pub fn broadcast_port(&self) -> Option<Arc<Port>> {
        self.inner.registry.broadcast_port()
    }

    /// Writes the full frame to the port's stream.
    pub fn send(&self, msg: &Message, port: &Arc<Port>) -> Result<()> {
        debug!(
            "ipc send to {} (handle {:?}): code={} size={} seq={:x}",
            msg.dst,
            port.handle(),
            msg.code,
            msg.wire_size(),
            msg.seq
        );

        let wire = msg.encode();
        let transport = port.transport();
        let mut off = 0;

        while off < wire.len() {
            let n = transport.write(port.handle(), &wire[off..])?;
            if n == 0 {
                return Err(Error::ConnReset);
            }
            off += n;
        }

        Ok(())
    }

    /// Sends a request and blocks until its response arrives.
    ///
    /// Allocates a fresh sequence number when the message has none. A port
    /// torn down while the request is in flight wakes the caller with
    /// `Err(ConnReset)`.
    pub fn send_request(&self, msg: &mut Message, port: &Arc<Port>) -> Result<i32> {
        if msg.seq == 0 {
            msg.seq = self.next_seq();
        }

        let waiter = port.register_waiter(msg.seq);

        if let Err(err) = self.send(msg, port) {
            port.forget_waiter(msg.seq);
            return Err(err);
        }

        let retval = waiter.wait();
        if retval == -libc::ECONNRESET {
            return Err(Error::ConnReset);
        }
        Ok(retval)
    }

    /// Synthesizes and sends the response frame for a request.
    pub fn respond(&self, port: &Arc<Port>, dst: PeerId, retval: i32, seq: u64) -> Result<()> {
        let retval = if retval == RESPONSE_CALLBACK { 0 } else { retval };

        debug!("ipc send to {}: RESP({})", dst, retval);
        self.send(&frame::response(self.inner.vmid, dst, retval, seq), port)
    }

    /// Blocking framed read: returns the first frame when `seq` is 0,
    /// otherwise the frame matching `seq`. Frames that do not match are
    /// dispatched through the callback table on the way.
    pub fn receive(&self, port: &Arc<Port>, seq: u64) -> Result<Message> {
        match self.recv_loop(port, seq, true)? {
            Some(msg) => Ok(msg),
            None => Err(Error::ConnReset),
        }
    }

    /// Helper-side receive: dispatches every currently readable frame and
    /// returns.
    pub(crate) fn dispatch_incoming(&self, port: &Arc<Port>) -> Result<()> {
        self.recv_loop(port, 0, false).map(|_| ())
    }

    /// The receive loop behind both modes. Tolerates frames split across
    /// reads and multiple frames per read; frames from this instance itself
    /// (looped back by the broadcast stream) are silently dropped.
    fn recv_loop(&self, port: &Arc<Port>, seq: u64, want: bool) -> Result<Option<Message>> {
        // Keep the port alive for the whole loop, like any other caller.
        let port = port.clone();
        let transport = port.transport().clone();
        let handle = port.handle();

        let mut buf = vec![0u8; HEADER_SIZE + RECV_READAHEAD];
        let mut bytes = 0;

        loop {
            // assemble the fixed header
            while bytes < HEADER_SIZE {
                match self.read_some(&transport, &port, &mut buf, bytes, HEADER_SIZE)? {
                    Some(n) => bytes += n,
                    None => {
                        // Quiet end of stream: leave disconnect handling to
                        // the attribute query that follows. An unmatched
                        // wait is a reset from the caller's point of view.
                        if want && seq != 0 {
                            return Err(Error::ConnReset);
                        }
                        return Ok(None);
                    }
                }
            }

            let header = match Header::decode(&buf[..HEADER_SIZE]) {
                Ok(header) => header,
                Err(err) => {
                    debug!("port (handle {:?}) is removed at bad frame", handle);
                    self.del_port_final(&port, Error::Inval.code());
                    return Err(err);
                }
            };
            let expected = header.size as usize;

            // assemble the body, possibly split across many reads
            while bytes < expected {
                match self.read_some(&transport, &port, &mut buf, bytes, expected)? {
                    Some(n) => bytes += n,
                    None => {
                        if want && seq != 0 {
                            return Err(Error::ConnReset);
                        }
                        return Ok(None);
                    }
                }
            }

            debug!(
                "receive a message from port (handle {:?}): code={} size={} src={} dst={} seq={:x}",
                handle, header.code, header.size, header.src, header.dst, header.seq
            );

            if want && (seq == 0 || header.seq == seq) {
                return Ok(Some(header.into_message(&buf[..expected])));
            }

            if header.src == self.inner.vmid {
                // own frame looped back on the broadcast channel
            } else {
                match self.inner.callbacks.get(header.code) {
                    Some(callback) => {
                        let callback = callback.clone();
                        let msg = header.into_message(&buf[..expected]);
                        let ret = (*callback)(self, &msg, &port);

                        if (ret < 0 || ret == RESPONSE_CALLBACK) && header.seq != 0 {
                            if let Err(err) = self.respond(&port, header.src, ret, header.seq) {
                                warn!(
                                    "response to {} (handle {:?}) failed: {}",
                                    header.src, handle, err
                                );
                            }
                        }
                    }
                    None => warn!("no callback for message code {}", header.code),
                }
            }

            buf.copy_within(expected..bytes, 0);
            bytes -= expected;

            if bytes == 0 && !(want && seq != 0) {
                return Ok(None);
            }
        }
    }

    /// One read step of the receive loop: pulls up to a readahead's worth of
    /// extra bytes past `expected`. `Ok(None)` is quiet end of stream; a
    /// transport error removes the port with a child-lost finalization.
    fn read_some(
        &self,
        transport: &Arc<dyn Transport>,
        port: &Arc<Port>,
        buf: &mut Vec<u8>,
        bytes: usize,
        expected: usize,
    ) -> Result<Option<usize>> {
        let goal = expected + RECV_READAHEAD;
        if buf.len() < goal {
            buf.resize(goal, 0);
        }

        match transport.read(port.handle(), &mut buf[bytes..goal]) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(err) => {
                debug!("port (handle {:?}) is removed at reading", port.handle());
                self.del_port_final(port, Error::ChildLost.code());
                Err(err.into())
            }
        }
    }

    /// Sends `msg` to every port whose mask intersects `target`, skipping
    /// the exclusion set. With an empty `target` the message goes out once
    /// over the broadcast stream instead, if one exists.
    ///
    /// Per-port failures are logged and swallowed; broadcast never fails as
    /// a whole.
    pub fn broadcast(
        &self,
        msg: &mut Message,
        exclude: &[Arc<Port>],
        target: PortType,
    ) -> Result<()> {
        if target.is_empty() {
            if let Some(bport) = self.inner.registry.broadcast_port() {
                if exclude.iter().any(|p| Arc::ptr_eq(p, &bport)) {
                    return Ok(());
                }

                debug!("send to broadcast stream");
                match self.send(msg, &bport) {
                    Ok(()) => return Ok(()),
                    Err(err) => warn!("broadcast stream send failed: {}", err),
                }
            }
            return Ok(());
        }

        let reg = self.inner.registry.lock();

        for port in reg.poll_list.iter() {
            if !port.type_mask().intersects(target) {
                continue;
            }
            // the broadcast stream is a send channel, not a fan-out target
            if let Some(bport) = &reg.broadcast {
                if Arc::ptr_eq(bport, port) {
                    continue;
                }
            }
            if exclude.iter().any(|p| Arc::ptr_eq(p, port)) {
                continue;
            }

            msg.dst = port.peer();
            debug!(
                "broadcast to port (handle {:?}) for process {}",
                port.handle(),
                msg.dst
            );

            if let Err(err) = self.send(msg, port) {
                warn!(
                    "broadcast send to (handle {:?}) failed: {}",
                    port.handle(),
                    err
                );
            }
        }

        Ok(())
    }
}
