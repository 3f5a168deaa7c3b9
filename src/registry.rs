use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use log::debug;

use crate::port::{Finalizer, Port, MAX_PORT_FINALIZERS};
use crate::port_type::PortType;
use crate::transport::{Handle, Transport};
use crate::PeerId;

/// The two indexes over live ports.
///
/// `by_peer` hashes ports under their peer id (never 0). `poll_list` keeps
/// every registered port in insertion order: ports that just became pollable
/// are pushed to the head with `recent` set, and the poller's pickup pass
/// walks from the head until the first non-recent entry. Each index
/// membership holds one strong reference.
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

pub(crate) struct RegistryInner {
    pub by_peer: IndexMap<PeerId, Vec<Arc<Port>>>,
    pub poll_list: VecDeque<Arc<Port>>,
    pub broadcast: Option<Arc<Port>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: Mutex::new(RegistryInner {
                by_peer: IndexMap::new(),
                poll_list: VecDeque::new(),
                broadcast: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap()
    }

    /// Registers (or reclassifies) `port`. Returns whether the poller needs
    /// a restart to pick up a newly pollable port.
    pub fn add_port(
        &self,
        port: &Arc<Port>,
        peer: PeerId,
        ty: PortType,
        fini: Option<Finalizer>,
    ) -> bool {
        let mut inner = self.lock();
        Self::add_locked(&mut inner, port, peer, ty, fini)
    }

    /// Looks up a port by `(peer, handle)` in the hash, then by `handle` in
    /// the poll list, reusing it if found; otherwise wraps `handle` in a new
    /// port. Merges `peer`/`ty`/`fini` into the result.
    pub fn add_port_by_id(
        &self,
        transport: &Arc<dyn Transport>,
        peer: PeerId,
        handle: Handle,
        ty: PortType,
        fini: Option<Finalizer>,
    ) -> (Arc<Port>, bool) {
        let mut inner = self.lock();

        let mut port = None;

        if peer != 0 {
            if let Some(bucket) = inner.by_peer.get(&peer) {
                port = bucket
                    .iter()
                    .find(|p| p.peer() == peer && p.handle() == handle)
                    .cloned();
            }
        }

        if port.is_none() {
            port = inner
                .poll_list
                .iter()
                .find(|p| p.handle() == handle)
                .cloned();
        }

        let port = match port {
            Some(port) => port,
            None => Port::new(handle, transport.clone()),
        };

        let need_restart = Self::add_locked(&mut inner, &port, peer, ty, fini);
        (port, need_restart)
    }

    fn add_locked(
        inner: &mut RegistryInner,
        port: &Arc<Port>,
        peer: PeerId,
        ty: PortType,
        fini: Option<Finalizer>,
    ) -> bool {
        let mut st = port.state.lock().unwrap();

        debug!(
            "adding port (handle {:?}) for process {} (type {:?})",
            port.handle(),
            peer,
            ty
        );

        if peer != 0 && st.peer == 0 {
            st.peer = peer;
            st.dirty = true;
        }

        if st.peer != 0 && !st.in_hash {
            inner
                .by_peer
                .entry(st.peer)
                .or_default()
                .push(port.clone());
            st.in_hash = true;
        }

        let need_restart = !st.mask.is_pollable() && ty.is_pollable();

        if !st.mask.contains(ty) {
            st.mask.insert(ty);
            st.dirty = true;
        }

        if let Some(fini) = fini {
            if !(ty - PortType::pollable()).is_empty()
                && !st.finalizers.iter().any(|f| Arc::ptr_eq(f, &fini))
            {
                assert!(
                    st.finalizers.len() < MAX_PORT_FINALIZERS,
                    "finalizer list overflow on port {:?}",
                    port.handle()
                );
                st.finalizers.push(fini);
            }
        }

        if need_restart {
            if !st.in_list {
                inner.poll_list.push_front(port.clone());
                st.in_list = true;
                st.recent = true;
            } else if !st.recent {
                if let Some(pos) = inner
                    .poll_list
                    .iter()
                    .position(|p| Arc::ptr_eq(p, port))
                {
                    let moved = inner.poll_list.remove(pos).unwrap();
                    inner.poll_list.push_front(moved);
                }
                st.recent = true;
            }
            true
        } else {
            if !st.in_list {
                inner.poll_list.push_back(port.clone());
                st.in_list = true;
            }
            false
        }
    }

    /// Deregisters `ty` from `port`; `PortType::empty()` clears everything.
    /// A port still carrying other non-POLLABLE/KEEPALIVE bits is only
    /// masked; otherwise it leaves both indexes. Returns whether the poller
    /// needs a restart.
    pub fn del_port(&self, port: &Arc<Port>, ty: PortType) -> bool {
        let mut inner = self.lock();
        Self::del_locked(&mut inner, port, ty)
    }

    fn del_locked(inner: &mut RegistryInner, port: &Arc<Port>, ty: PortType) -> bool {
        let mut st = port.state.lock().unwrap();

        debug!(
            "deleting port (handle {:?}) for process {} (type {:?} of {:?})",
            port.handle(),
            st.peer,
            ty,
            st.mask
        );

        let effective = if ty.is_empty() { st.mask } else { ty & st.mask };

        let mut need_restart = effective.is_keepalive();

        if !(st.mask - (effective | PortType::pollable() | PortType::keepalive())).is_empty() {
            st.mask.remove(effective);
            st.dirty = true;
            return need_restart;
        }

        if st.mask.is_pollable() {
            need_restart = true;
        }

        if st.in_list {
            if let Some(pos) = inner.poll_list.iter().position(|p| Arc::ptr_eq(p, port)) {
                inner.poll_list.remove(pos);
            }
            st.in_list = false;
        }

        if st.in_hash {
            if let Some(bucket) = inner.by_peer.get_mut(&st.peer) {
                bucket.retain(|p| !Arc::ptr_eq(p, port));
                if bucket.is_empty() {
                    inner.by_peer.swap_remove(&st.peer);
                }
            }
            st.in_hash = false;
        }

        st.mask = PortType::empty();
        st.dirty = true;
        need_restart
    }

    /// Deregisters `ty` from every port hashed under `peer`.
    pub fn del_port_by_id(&self, peer: PeerId, ty: PortType) -> bool {
        let mut inner = self.lock();

        let bucket: Vec<Arc<Port>> = match inner.by_peer.get(&peer) {
            Some(bucket) => bucket.clone(),
            None => return false,
        };

        let mut need_restart = false;
        for port in &bucket {
            if port.peer() == peer && Self::del_locked(&mut inner, port, ty) {
                need_restart = true;
            }
        }
        need_restart
    }

    /// Deregisters `ty` from every port in the poll list.
    pub fn del_all(&self, ty: PortType) -> bool {
        let mut inner = self.lock();

        let ports: Vec<Arc<Port>> = inner.poll_list.iter().cloned().collect();

        let mut need_restart = false;
        for port in &ports {
            if Self::del_locked(&mut inner, port, ty) {
                need_restart = true;
            }
        }
        need_restart
    }

    /// Fully removes `port`, then — with the registry lock released — runs
    /// its finalizers exactly once in registration order and wakes every
    /// pending request with a connection-reset result.
    pub fn del_port_final(&self, port: &Arc<Port>, exit_code: i32) -> bool {
        let (finalizers, peer, need_restart) = {
            let mut inner = self.lock();

            let (finalizers, peer) = {
                let mut st = port.state.lock().unwrap();
                (std::mem::take(&mut st.finalizers), st.peer)
            };

            let need_restart = Self::del_locked(&mut inner, port, PortType::empty());
            (finalizers, peer, need_restart)
        };

        for fini in finalizers {
            (*fini)(port, peer, exit_code);
        }

        port.abort_pending(-libc::ECONNRESET);
        need_restart
    }

    /// First port hashed under `peer` whose mask intersects `ty` (any port
    /// when `ty` is empty).
    pub fn lookup_port(&self, peer: PeerId, ty: PortType) -> Option<Arc<Port>> {
        let inner = self.lock();

        inner.by_peer.get(&peer).and_then(|bucket| {
            bucket
                .iter()
                .find(|p| {
                    let mask = p.type_mask();
                    ty.is_empty() || mask.intersects(ty)
                })
                .cloned()
        })
    }

    /// Records `port` as the distinguished broadcast port.
    pub fn set_broadcast(&self, port: Arc<Port>) {
        self.lock().broadcast = Some(port);
    }

    /// Clears the broadcast slot if it still names `port`.
    pub fn clear_broadcast(&self, port: &Arc<Port>) {
        let mut inner = self.lock();
        if let Some(current) = &inner.broadcast {
            if Arc::ptr_eq(current, port) {
                inner.broadcast = None;
            }
        }
    }

    /// The broadcast port, acquired under the registry lock.
    pub fn broadcast_port(&self) -> Option<Arc<Port>> {
        self.lock().broadcast.clone()
    }

    pub fn has_keepalive(&self) -> bool {
        let inner = self.lock();
        inner.poll_list.iter().any(|p| p.type_mask().is_keepalive())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::Loopback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Registry, Arc<dyn Transport>, Handle, Handle) {
        let transport = Arc::new(Loopback::new());
        let (a, b) = transport.stream_pair();
        (Registry::new(), transport as Arc<dyn Transport>, a, b)
    }

    #[test]
    fn add_indexes_and_refcounts() {
        let (registry, transport, a, _b) = setup();

        let (port, restart) = registry.add_port_by_id(
            &transport,
            5,
            a,
            PortType::listen() | PortType::pollable(),
            None,
        );

        assert!(restart);
        assert_eq!(port.peer(), 5);
        assert!(port.type_mask().contains(PortType::listen() | PortType::pollable()));

        // hash + poll list + our reference
        assert_eq!(Arc::strong_count(&port), 3);

        let found = registry.lookup_port(5, PortType::listen()).unwrap();
        assert!(Arc::ptr_eq(&found, &port));
        assert!(registry.lookup_port(5, PortType::server()).is_none());
        assert!(registry.lookup_port(6, PortType::empty()).is_none());
    }

    #[test]
    fn add_same_handle_reuses_port() {
        let (registry, transport, a, _b) = setup();

        let (first, _) = registry
            .add_port_by_id(&transport, 0, a, PortType::pollable(), None);
        let (second, restart) = registry
            .add_port_by_id(&transport, 9, a, PortType::listen(), None);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!restart);
        assert_eq!(second.peer(), 9);
        assert!(registry.lookup_port(9, PortType::listen()).is_some());
    }

    #[test]
    fn partial_del_masks_only() {
        let (registry, transport, a, _b) = setup();

        let ty = PortType::listen() | PortType::direct_parent() | PortType::pollable();
        let (port, _) = registry.add_port_by_id(&transport, 3, a, ty, None);

        let restart = registry.del_port(&port, PortType::listen());
        assert!(!restart);
        assert!(port.type_mask().contains(PortType::direct_parent()));
        assert!(registry.lookup_port(3, PortType::direct_parent()).is_some());

        let restart = registry.del_port(&port, PortType::direct_parent());
        assert!(restart);
        assert!(port.type_mask().is_empty());
        assert!(registry.lookup_port(3, PortType::empty()).is_none());
        assert_eq!(Arc::strong_count(&port), 1);
    }

    #[test]
    fn finalizer_fires_exactly_once() {
        let (registry, transport, a, _b) = setup();

        let fired = Arc::new(AtomicUsize::new(0));
        let fini: Finalizer = {
            let fired = fired.clone();
            Arc::new(move |_port, peer, code| {
                assert_eq!(peer, 7);
                assert_eq!(code, -libc::ECONNRESET);
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        let (port, _) = registry.add_port_by_id(
            &transport,
            7,
            a,
            PortType::listen() | PortType::pollable(),
            Some(fini.clone()),
        );

        // append-if-absent: same callback registered twice is stored once
        registry.add_port(&port, 7, PortType::listen(), Some(fini));

        registry.del_port_final(&port, -libc::ECONNRESET);
        registry.del_port_final(&port, -libc::ECONNRESET);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn del_by_peer_clears_bucket() {
        let (registry, transport, a, b) = setup();

        registry
            .add_port_by_id(&transport, 4, a, PortType::listen() | PortType::pollable(), None);
        registry
            .add_port_by_id(&transport, 4, b, PortType::listen() | PortType::pollable(), None);

        let restart = registry.del_port_by_id(4, PortType::empty());
        assert!(restart);
        assert!(registry.lookup_port(4, PortType::empty()).is_none());
        assert!(registry.lock().poll_list.is_empty());
    }

    #[test]
    fn recent_ports_go_to_head() {
        let (registry, transport, a, b) = setup();

        let (first, _) = registry
            .add_port_by_id(&transport, 0, a, PortType::listen() | PortType::pollable(), None);
        let (second, _) = registry
            .add_port_by_id(&transport, 0, b, PortType::listen() | PortType::pollable(), None);

        let inner = registry.lock();
        assert!(Arc::ptr_eq(&inner.poll_list[0], &second));
        assert!(Arc::ptr_eq(&inner.poll_list[1], &first));
        assert!(inner.poll_list[0].state.lock().unwrap().recent);
    }

    #[test]
    fn keepalive_scan() {
        let (registry, transport, a, _b) = setup();

        assert!(!registry.has_keepalive());

        let (port, _) = registry.add_port_by_id(
            &transport,
            0,
            a,
            PortType::keepalive() | PortType::pollable(),
            None,
        );

        assert!(registry.has_keepalive());

        registry.del_port(&port, PortType::keepalive());
        assert!(!registry.has_keepalive());
    }
}
