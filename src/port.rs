use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::port_type::PortType;
use crate::transport::{Handle, Transport};
use crate::PeerId;

/// Upper bound on finalizers registered on one port.
pub const MAX_PORT_FINALIZERS: usize = 3;

/// Callback invoked once when a port is finally removed, with the port, the
/// peer id it was indexed under and the removal exit code.
pub type Finalizer = Arc<dyn Fn(&Arc<Port>, PeerId, i32) + Send + Sync>;

/// One logical endpoint wrapping one transport stream.
///
/// Ports are shared as `Arc<Port>`: each registry index, the poller's local
/// snapshot and every caller hold their own strong reference, and the
/// transport handle is closed exactly once when the last reference drops.
///
/// Classification fields (`peer`, `mask`, bookkeeping flags) live behind the
/// `state` lock, which is only taken under the registry-lock discipline. The
/// pending-reply queue has its own lock, acquired only after the registry
/// lock has been released.
pub struct Port {
    handle: Handle,
    transport: Arc<dyn Transport>,
    pub(crate) state: Mutex<PortState>,
    replies: Mutex<Vec<Arc<ReplyWaiter>>>,
}

pub(crate) struct PortState {
    pub peer: PeerId,
    pub mask: PortType,
    /// `mask` or `peer` changed since the poller last snapshotted this port.
    pub dirty: bool,
    /// Newly made pollable; cleared when the poller picks the port up.
    pub recent: bool,
    pub in_hash: bool,
    pub in_list: bool,
    pub finalizers: Vec<Finalizer>,
}

impl Port {
    pub(crate) fn new(handle: Handle, transport: Arc<dyn Transport>) -> Arc<Port> {
        Arc::new(Port {
            handle,
            transport,
            state: Mutex::new(PortState {
                peer: 0,
                mask: PortType::empty(),
                dirty: true,
                recent: false,
                in_hash: false,
                in_list: false,
                finalizers: Vec::new(),
            }),
            replies: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn peer(&self) -> PeerId {
        self.state.lock().unwrap().peer
    }

    pub fn type_mask(&self) -> PortType {
        self.state.lock().unwrap().mask
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Attaches an in-flight request descriptor awaiting the reply with
    /// sequence number `seq`.
    pub(crate) fn register_waiter(&self, seq: u64) -> Arc<ReplyWaiter> {
        let waiter = Arc::new(ReplyWaiter {
            seq,
            result: Mutex::new(None),
            cond: Condvar::new(),
        });

        self.replies.lock().unwrap().push(waiter.clone());
        waiter
    }

    /// Completes the waiter matching `seq`, if any. Returns whether a waiter
    /// was woken.
    pub(crate) fn complete_waiter(&self, seq: u64, retval: i32) -> bool {
        let mut replies = self.replies.lock().unwrap();

        match replies.iter().position(|w| w.seq == seq) {
            Some(idx) => {
                let waiter = replies.remove(idx);
                drop(replies);
                waiter.complete(retval);
                true
            }
            None => false,
        }
    }

    /// Detaches a waiter whose request never made it out.
    pub(crate) fn forget_waiter(&self, seq: u64) {
        let mut replies = self.replies.lock().unwrap();
        replies.retain(|w| w.seq != seq);
    }

    /// Wakes every pending request with `retval` and clears the queue; used
    /// when the port is torn down underneath its callers.
    pub(crate) fn abort_pending(&self, retval: i32) {
        let drained: Vec<_> = {
            let mut replies = self.replies.lock().unwrap();
            replies.drain(..).collect()
        };

        if !drained.is_empty() {
            debug!(
                "waking {} pending request(s) on port (handle {:?}) with {}",
                drained.len(),
                self.handle,
                retval
            );
        }

        for waiter in drained {
            waiter.complete(retval);
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        debug!("closing port (handle {:?})", self.handle);
        self.transport.close(self.handle);
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Port").field("handle", &self.handle).finish()
    }
}

/// In-flight request descriptor: the sending thread blocks on `wait` until
/// the response callback (or port teardown) posts a result.
pub(crate) struct ReplyWaiter {
    pub seq: u64,
    result: Mutex<Option<i32>>,
    cond: Condvar,
}

impl ReplyWaiter {
    pub fn wait(&self) -> i32 {
        let mut result = self.result.lock().unwrap();

        loop {
            match *result {
                Some(retval) => return retval,
                None => result = self.cond.wait(result).unwrap(),
            }
        }
    }

    pub fn complete(&self, retval: i32) {
        let mut result = self.result.lock().unwrap();
        *result = Some(retval);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::Loopback;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waiter_completion_by_seq() {
        let transport = Arc::new(Loopback::new());
        let (a, _b) = transport.stream_pair();
        let port = Port::new(a, transport);

        let w42 = port.register_waiter(42);
        let _w43 = port.register_waiter(43);

        assert!(!port.complete_waiter(41, 0));
        assert!(port.complete_waiter(42, 7));
        assert_eq!(w42.wait(), 7);

        // already removed
        assert!(!port.complete_waiter(42, 8));
    }

    #[test]
    fn abort_wakes_every_waiter() {
        let transport = Arc::new(Loopback::new());
        let (a, _b) = transport.stream_pair();
        let port = Port::new(a, transport);

        let w1 = port.register_waiter(1);
        let w2 = port.register_waiter(2);

        let th = {
            let w1 = w1.clone();
            thread::spawn(move || w1.wait())
        };
        thread::sleep(Duration::from_millis(20));

        port.abort_pending(-libc::ECONNRESET);

        assert_eq!(th.join().unwrap(), -libc::ECONNRESET);
        assert_eq!(w2.wait(), -libc::ECONNRESET);
    }

    #[test]
    fn drop_closes_handle_once() {
        let transport = Arc::new(Loopback::new());
        let (a, b) = transport.stream_pair();

        let port = Port::new(a, transport.clone() as Arc<dyn crate::transport::Transport>);
        let other = port.clone();
        drop(port);

        // still open while a reference remains
        assert!(transport.query_attrs(a).is_ok());

        drop(other);
        assert!(transport.query_attrs(a).is_err());
        assert!(transport.query_attrs(b).unwrap().disconnected);
    }
}
