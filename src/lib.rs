//! IPC core for cooperating library-OS instances.
//!
//! Each instance runs as an isolated process; this crate multiplexes the
//! message streams between sibling instances, their parent and the
//! namespace leaders. A single helper thread waits on the union of all
//! registered ports plus a wake event, accepts clients on server ports,
//! reads framed messages and dispatches them through a code-indexed
//! callback table; any other thread may register ports, send requests and
//! broadcast while the helper is asleep, and the restart protocol makes
//! sure the helper's watch-set catches up.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use libos_ipc::transport::UnixTransport;
//! use libos_ipc::{BootstrapPorts, CallbackTable, Endpoint, IpcCore};
//!
//! fn main() -> libos_ipc::Result<()> {
//!     let transport = Arc::new(UnixTransport::new());
//!
//!     let mut callbacks = CallbackTable::with_capacity(8);
//!     callbacks.register(1, |_core, msg, _port| {
//!         println!("hello from instance {}", msg.src);
//!         0
//!     });
//!
//!     let core = IpcCore::new(transport, 1, callbacks);
//!
//!     let mut boot = BootstrapPorts::default();
//!     boot.self_server = Some(Endpoint::uri(1, "unix.srv:/tmp/instance-1.sock"));
//!     core.init_ports(boot)?;
//!     core.init_helper()?;
//!     core.create_helper()?;
//!
//!     // ... add ports, send requests, broadcast ...
//!
//!     core.terminate_helper()?;
//!     core.join_helper();
//!     Ok(())
//! }
//! ```

mod callback;
mod core;
mod error;
mod frame;
mod helper;
mod port;
mod port_type;
mod registry;

pub mod transport;

/// Identifier of one library-OS instance; 0 means "unknown/any".
pub type PeerId = u32;

pub use callback::{Callback, CallbackTable, RESPONSE_CALLBACK};

pub use crate::core::{BootstrapPorts, Endpoint, IpcCore};

pub use error::{Error, Result};

pub use frame::{Header, Message, CODE_RESP, HEADER_SIZE, RECV_READAHEAD};

pub use helper::HelperState;

pub use port::{Finalizer, Port, MAX_PORT_FINALIZERS};

pub use port_type::PortType;

pub use transport::{Handle, StreamAttrs, Transport};
