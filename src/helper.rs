use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, warn};

use crate::core::IpcCore;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::port_type::PortType;
use crate::transport::Handle;
use crate::PeerId;

const WATCH_LIST_INIT: usize = 32;

/// Lifecycle of the helper thread.
///
/// `Uninitialized → Delayed → NotAlive ↔ Alive → HandedOver → NotAlive`.
/// A restart request before initialization is deferred (`Delayed`) and
/// honored by `init_helper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperState {
    Uninitialized = 0,
    Delayed = 1,
    NotAlive = 2,
    Alive = 3,
    HandedOver = 4,
}

impl HelperState {
    fn from_u8(raw: u8) -> HelperState {
        match raw {
            0 => HelperState::Uninitialized,
            1 => HelperState::Delayed,
            2 => HelperState::NotAlive,
            3 => HelperState::Alive,
            _ => HelperState::HandedOver,
        }
    }
}

/// Shared lifecycle state: the state word, the "you have work" flag and
/// wake event, and the helper thread's identity.
pub(crate) struct Lifecycle {
    state: AtomicU8,
    /// Set instead of signaling the event when the mutation happens on the
    /// helper thread itself.
    pub update: AtomicBool,
    event: Mutex<Option<Handle>>,
    tid: Mutex<Option<ThreadId>>,
    join: Mutex<Option<JoinHandle<()>>>,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            state: AtomicU8::new(HelperState::Uninitialized as u8),
            update: AtomicBool::new(false),
            event: Mutex::new(None),
            tid: Mutex::new(None),
            join: Mutex::new(None),
            hook: Mutex::new(None),
        }
    }

    pub fn state(&self) -> HelperState {
        HelperState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: HelperState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn event(&self) -> Option<Handle> {
        *self.event.lock().unwrap()
    }

    fn in_helper(&self) -> bool {
        *self.tid.lock().unwrap() == Some(thread::current().id())
    }
}

/// One watched port as the helper last snapshotted it. The snapshot owns a
/// reference; classification changes reach it only through reconcile.
struct LocalPort {
    port: Arc<Port>,
    peer: PeerId,
    mask: PortType,
}

impl IpcCore {
    /// Finishes lifecycle initialization: creates the wake event and spawns
    /// the helper if a restart request arrived before init.
    pub fn init_helper(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;

        let need_helper = lifecycle.state() == HelperState::Delayed;
        lifecycle.set_state(HelperState::NotAlive);

        let event = self.inner.transport.create_event()?;
        *lifecycle.event.lock().unwrap() = Some(event);

        if need_helper {
            self.create_helper()?;
        }
        Ok(())
    }

    /// Spawns the helper thread. A concurrent spawn loses the race and
    /// returns success; spawn failure rolls the state back to NotAlive.
    pub fn create_helper(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;

        if lifecycle.state() == HelperState::Alive {
            return Ok(());
        }

        let mut tid = lifecycle.tid.lock().unwrap();
        if lifecycle.state() == HelperState::Alive {
            return Ok(());
        }

        lifecycle.set_state(HelperState::Alive);

        let core = self.clone();
        match thread::Builder::new()
            .name("ipc-helper".to_owned())
            .spawn(move || helper_main(core))
        {
            Ok(join) => {
                *tid = Some(join.thread().id());
                *lifecycle.join.lock().unwrap() = Some(join);
                Ok(())
            }
            Err(err) => {
                lifecycle.set_state(HelperState::NotAlive);
                *tid = None;
                Err(Error::Transport(err))
            }
        }
    }

    /// The restart protocol: makes sure the helper will notice registry
    /// changes, spawning it, signaling the wake event, or just setting the
    /// update flag depending on who calls from where.
    pub(crate) fn restart_helper(&self, need_create: bool) {
        let lifecycle = &self.inner.lifecycle;

        match lifecycle.state() {
            HelperState::Uninitialized => lifecycle.set_state(HelperState::Delayed),
            HelperState::Delayed => {}
            HelperState::NotAlive => {
                if need_create {
                    if let Err(err) = self.create_helper() {
                        warn!("helper spawn failed: {}", err);
                    }
                }
            }
            HelperState::Alive => {
                if lifecycle.in_helper() {
                    lifecycle.update.store(true, Ordering::SeqCst);
                    return;
                }
                debug!("set ipc helper restart");
                if let Err(err) = self.signal_event() {
                    warn!("helper wake failed: {}", err);
                }
            }
            HelperState::HandedOver => lifecycle.update.store(true, Ordering::SeqCst),
        }
    }

    /// Requests process exit. With `handover` and live KEEPALIVE ports the
    /// helper stays behind to service them and the caller gets
    /// `Err(TryAgain)`, meaning: suspend the exit until the helper is done.
    pub fn exit_with_helper(&self, handover: bool) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;

        if lifecycle.in_helper() || lifecycle.state() != HelperState::Alive {
            return Ok(());
        }

        let handover = handover && self.inner.registry.has_keepalive();

        if handover {
            debug!("handing over to ipc helper");
            lifecycle.set_state(HelperState::HandedOver);
        } else {
            debug!("exiting ipc helper");
            lifecycle.set_state(HelperState::NotAlive);
        }

        self.signal_event()?;

        if handover {
            Err(Error::TryAgain)
        } else {
            Ok(())
        }
    }

    /// Forces the helper down regardless of KEEPALIVE ports.
    pub fn terminate_helper(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;

        let tid = lifecycle.tid.lock().unwrap();
        if tid.is_none() {
            return Err(Error::NoHelper);
        }

        debug!("terminating ipc helper");
        lifecycle.set_state(HelperState::NotAlive);
        self.signal_event()?;
        Ok(())
    }

    /// Registers the process-cleanup hook the helper runs when a handed-over
    /// loop finishes.
    pub fn set_handover_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.lifecycle.hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Blocks until the helper thread exits. No-op when none was spawned.
    pub fn join_helper(&self) {
        let join = self.inner.lifecycle.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    pub fn helper_state(&self) -> HelperState {
        self.inner.lifecycle.state()
    }

    fn signal_event(&self) -> Result<()> {
        if let Some(event) = self.inner.lifecycle.event() {
            self.inner.transport.set_event(event)?;
        }
        Ok(())
    }
}

/// The helper thread: waits on the union of watched ports plus the wake
/// event, services whatever fired, and reconciles its watch-set against the
/// registry whenever the update flag says it drifted.
fn helper_main(core: IpcCore) {
    debug!("ipc helper thread started");

    let lifecycle = &core.inner.lifecycle;
    let transport = &core.inner.transport;

    let event = match lifecycle.event() {
        Some(event) => event,
        None => {
            warn!("helper started without a wake event");
            return;
        }
    };

    let mut locals: Vec<LocalPort> = Vec::with_capacity(WATCH_LIST_INIT);
    let mut handles: Vec<Handle> = Vec::with_capacity(WATCH_LIST_INIT + 1);
    handles.push(event);

    let mut nalive = 0usize;

    if lifecycle.state() != HelperState::NotAlive {
        reconcile(&core, &mut locals, &mut handles, &mut nalive);

        while lifecycle.state() == HelperState::Alive || nalive > 0 {
            let polled = match transport.wait_any(&handles, None) {
                Ok(handle) => handle,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("helper wait failed: {}", err);
                    continue;
                }
            };

            if polled == event {
                let _ = transport.clear_event(event);
                if lifecycle.state() == HelperState::NotAlive {
                    break;
                }
                reconcile(&core, &mut locals, &mut handles, &mut nalive);
                continue;
            }

            let (port, peer, mask) = match locals.iter().find(|lp| lp.port.handle() == polled) {
                Some(lp) => (lp.port.clone(), lp.peer, lp.mask),
                None => continue,
            };

            if mask.is_server() {
                match transport.accept(polled) {
                    Ok(client) => {
                        let ty = (mask - PortType::server()) | PortType::listen();
                        core.add_port_by_id(peer, client, ty, None);
                    }
                    Err(err) => {
                        debug!(
                            "port (handle {:?}) is removed at accepting: {}",
                            polled, err
                        );
                        core.del_port_final(&port, Error::ChildLost.code());
                    }
                }
                reconcile(&core, &mut locals, &mut handles, &mut nalive);
                continue;
            }

            match transport.query_attrs(polled) {
                Err(err) => {
                    debug!("port (handle {:?}) is removed at querying: {}", polled, err);
                    let code = Error::from(err).code();
                    core.del_port_final(&port, code);
                    reconcile(&core, &mut locals, &mut handles, &mut nalive);
                    continue;
                }
                Ok(attrs) => {
                    if attrs.readable {
                        let _ = core.dispatch_incoming(&port);
                    }

                    if attrs.disconnected {
                        debug!("port (handle {:?}) is disconnected", polled);
                        core.del_port_final(&port, Error::ConnReset.code());
                        reconcile(&core, &mut locals, &mut handles, &mut nalive);
                        continue;
                    }
                }
            }

            if lifecycle.update.load(Ordering::SeqCst) {
                reconcile(&core, &mut locals, &mut handles, &mut nalive);
            }
        }
    }

    // Release every snapshot reference before announcing the exit.
    locals.clear();
    handles.clear();

    if lifecycle.state() == HelperState::HandedOver {
        debug!("ipc helper thread is the last thread, running cleanup hook");
        let hook = lifecycle.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    lifecycle.set_state(HelperState::NotAlive);
    *lifecycle.tid.lock().unwrap() = None;

    debug!("ipc helper thread terminated");
}

/// Syncs the helper's watch-set with the registry.
///
/// Compact pass: drop snapshot entries whose port left the poll list,
/// refresh the ones marked dirty, keep everything else in order. Pickup
/// pass: adopt recently-added ports from the head of the poll list, which
/// is exactly where `add` puts them.
fn reconcile(
    core: &IpcCore,
    locals: &mut Vec<LocalPort>,
    handles: &mut Vec<Handle>,
    nalive: &mut usize,
) {
    let lifecycle = &core.inner.lifecycle;
    lifecycle.update.store(false, Ordering::SeqCst);

    let reg = core.inner.registry.lock();

    locals.retain_mut(|lp| {
        let mut st = lp.port.state.lock().unwrap();

        if !st.in_list {
            if lp.mask.is_keepalive() {
                *nalive -= 1;
            }
            return false;
        }

        if st.dirty {
            if lp.mask.is_keepalive() != st.mask.is_keepalive() {
                if st.mask.is_keepalive() {
                    *nalive += 1;
                } else {
                    *nalive -= 1;
                }
            }
            lp.mask = st.mask;
            lp.peer = st.peer;
            st.dirty = false;
        }

        true
    });

    for port in reg.poll_list.iter() {
        let mut st = port.state.lock().unwrap();

        if !st.recent {
            break;
        }

        st.recent = false;
        st.dirty = false;
        debug_assert!(st.mask.is_pollable());

        // A port deleted and re-added between two reconciles may still sit
        // in the snapshot; never watch it twice.
        if locals.iter().any(|lp| Arc::ptr_eq(&lp.port, port)) {
            continue;
        }

        if st.mask.is_keepalive() {
            *nalive += 1;
        }

        debug!(
            "listen to process {} on port (handle {:?}, type {:?})",
            st.peer,
            port.handle(),
            st.mask
        );

        locals.push(LocalPort {
            port: port.clone(),
            peer: st.peer,
            mask: st.mask,
        });
    }

    handles.truncate(1);
    for lp in locals.iter() {
        handles.push(lp.port.handle());
    }
}
