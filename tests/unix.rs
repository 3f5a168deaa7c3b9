use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use libos_ipc::transport::{Transport, UnixTransport};
use libos_ipc::{BootstrapPorts, CallbackTable, Endpoint, IpcCore, PortType};

const CODE_PING: u32 = 3;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn sock_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("libos-ipc-{}-{}.sock", tag, std::process::id()))
}

#[test]
fn two_instances_over_unix_sockets() {
    init_log();
    let path = sock_path("pair");

    // instance 1: serves its well-known socket and answers pings
    let mut callbacks = CallbackTable::with_capacity(8);
    callbacks.register(CODE_PING, |core: &IpcCore, msg, port| {
        let n = msg.body.first().copied().unwrap_or(0) as i32;
        core.respond(port, msg.src, n + 1, msg.seq).unwrap();
        0
    });

    let t1 = Arc::new(UnixTransport::new());
    let one = IpcCore::new(t1.clone() as Arc<dyn Transport>, 1, callbacks);
    one.init_helper().unwrap();

    let mut boot = BootstrapPorts::default();
    boot.self_server = Some(Endpoint::uri(1, format!("unix.srv:{}", path.display())));
    one.init_ports(boot).unwrap();

    // instance 2: connects to instance 1 and asks
    let t2 = Arc::new(UnixTransport::new());
    let two = IpcCore::new(t2.clone() as Arc<dyn Transport>, 2, CallbackTable::default());
    two.init_helper().unwrap();

    let handle = t2.open(&format!("unix:{}", path.display())).unwrap();
    let port = two.add_port_by_id(1, handle, PortType::listen() | PortType::pollable(), None);

    let mut msg = two.message(CODE_PING, 1, vec![41]);
    assert_eq!(two.send_request(&mut msg, &port).unwrap(), 42);

    two.terminate_helper().unwrap();
    one.terminate_helper().unwrap();
    two.join_helper();
    one.join_helper();

    let _ = std::fs::remove_file(&path);
}

#[test]
fn parent_bootstrap_over_socketpair() {
    init_log();

    // parent and child share a socketpair, as inherited across fork
    let parent_transport = Arc::new(UnixTransport::new());
    let child_transport = Arc::new(UnixTransport::new());

    let (parent_end, child_end) = std::os::unix::net::UnixStream::pair().unwrap();
    let parent_handle = parent_transport.adopt_stream(parent_end);
    let child_handle = child_transport.adopt_stream(child_end);

    let pings = Arc::new(AtomicUsize::new(0));
    let mut callbacks = CallbackTable::with_capacity(8);
    {
        let pings = pings.clone();
        callbacks.register(CODE_PING, move |_core: &IpcCore, msg, _port| {
            assert_eq!(msg.src, 7);
            pings.fetch_add(1, Ordering::SeqCst);
            0
        });
    }

    let parent = IpcCore::new(
        parent_transport.clone() as Arc<dyn Transport>,
        3,
        callbacks,
    );
    parent.init_helper().unwrap();

    // the parent's end of the pair is an ordinary child stream
    parent.add_port_by_id(
        7,
        parent_handle,
        PortType::listen() | PortType::pollable(),
        None,
    );

    let child = IpcCore::new(
        child_transport.clone() as Arc<dyn Transport>,
        7,
        CallbackTable::default(),
    );
    child.init_helper().unwrap();

    let mut boot = BootstrapPorts::default();
    boot.parent = Some(Endpoint::handle(3, child_handle));
    child.init_ports(boot).unwrap();

    let port = child
        .lookup_port(3, PortType::direct_parent())
        .expect("parent port bootstrapped");
    let msg = child.message(CODE_PING, 3, Vec::new());
    child.send(&msg, &port).unwrap();

    wait_until(|| pings.load(Ordering::SeqCst) == 1);

    child.terminate_helper().unwrap();
    parent.terminate_helper().unwrap();
    child.join_helper();
    parent.join_helper();
}

#[test]
fn accepted_client_port_inherits_listen_type() {
    init_log();
    let path = sock_path("accept");

    let seen = Arc::new(AtomicUsize::new(0));
    let mut callbacks = CallbackTable::with_capacity(8);
    {
        let seen = seen.clone();
        callbacks.register(CODE_PING, move |_core: &IpcCore, _msg, _port| {
            seen.fetch_add(1, Ordering::SeqCst);
            0
        });
    }

    let t1 = Arc::new(UnixTransport::new());
    let one = IpcCore::new(t1.clone() as Arc<dyn Transport>, 1, callbacks);
    one.init_helper().unwrap();

    let mut boot = BootstrapPorts::default();
    boot.self_server = Some(Endpoint::uri(1, format!("unix.srv:{}", path.display())));
    one.init_ports(boot).unwrap();

    // a bare client speaks the wire format directly
    let t2 = Arc::new(UnixTransport::new());
    let client = t2.open(&format!("unix:{}", path.display())).unwrap();

    let msg = libos_ipc::Message::new(CODE_PING, 9, 1, Vec::new());
    let wire = msg.encode();
    let mut off = 0;
    while off < wire.len() {
        off += t2.write(client, &wire[off..]).unwrap();
    }

    wait_until(|| seen.load(Ordering::SeqCst) == 1);

    one.terminate_helper().unwrap();
    one.join_helper();

    let _ = std::fs::remove_file(&path);
}
