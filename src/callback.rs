use std::sync::Arc;

use log::debug;

use crate::core::IpcCore;
use crate::frame::{self, Message, CODE_RESP};
use crate::port::Port;

/// Returned by a callback to request an explicit success response for the
/// frame it just consumed. Deliberately outside the negative-errno range;
/// rewritten to 0 in the synthesized response.
pub const RESPONSE_CALLBACK: i32 = i32::MIN;

/// Handler for one message code.
///
/// Return conventions: `0` means consumed with no reply; a negative value is
/// an error reflected as a response when the frame carried a sequence
/// number; [`RESPONSE_CALLBACK`] requests a success response now.
pub type Callback = Arc<dyn Fn(&IpcCore, &Message, &Arc<Port>) -> i32 + Send + Sync>;

/// Code-indexed callback table, immutable once the core is constructed.
pub struct CallbackTable {
    slots: Vec<Option<Callback>>,
}

impl CallbackTable {
    /// Table with room for codes `0..codes`. Code 0 is reserved for the
    /// built-in response handler.
    pub fn with_capacity(codes: usize) -> CallbackTable {
        CallbackTable {
            slots: vec![None; codes.max(1)],
        }
    }

    /// Registers the handler for `code`, replacing any previous one.
    pub fn register<F>(&mut self, code: u32, callback: F)
    where
        F: Fn(&IpcCore, &Message, &Arc<Port>) -> i32 + Send + Sync + 'static,
    {
        let idx = code as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        self.slots[idx] = Some(Arc::new(callback));
    }

    pub(crate) fn get(&self, code: u32) -> Option<&Callback> {
        self.slots.get(code as usize).and_then(|slot| slot.as_ref())
    }

    /// Installs the response handler at [`CODE_RESP`] unless the embedder
    /// overrode it.
    pub(crate) fn install_response_handler(&mut self) {
        if self.get(CODE_RESP).is_none() {
            self.register(CODE_RESP, resp_callback);
        }
    }
}

impl Default for CallbackTable {
    fn default() -> CallbackTable {
        CallbackTable::with_capacity(1)
    }
}

/// Completes the in-flight request matching the response's sequence number.
///
/// A response without a sequence number, or one whose waiter is already
/// gone, just surfaces its retval to the receive loop.
fn resp_callback(_core: &IpcCore, msg: &Message, port: &Arc<Port>) -> i32 {
    let retval = frame::response_retval(msg);

    debug!("ipc callback from {}: RESP({})", msg.src, retval);

    if msg.seq == 0 {
        return retval;
    }

    if port.complete_waiter(msg.seq, retval) {
        0
    } else {
        retval
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut table = CallbackTable::with_capacity(4);
        table.register(3, |_core, _msg, _port| 0);

        assert!(table.get(3).is_some());
        assert!(table.get(2).is_none());
        assert!(table.get(100).is_none());
    }

    #[test]
    fn response_handler_installed_once() {
        let mut table = CallbackTable::default();
        table.install_response_handler();
        assert!(table.get(CODE_RESP).is_some());

        // an embedder-provided handler survives
        let mut table = CallbackTable::with_capacity(1);
        table.register(CODE_RESP, |_core, _msg, _port| 99);
        table.install_response_handler();
        // still the embedder's: exercised indirectly, just check presence
        assert!(table.get(CODE_RESP).is_some());
    }

    #[test]
    fn table_grows_for_large_codes() {
        let mut table = CallbackTable::with_capacity(1);
        table.register(17, |_core, _msg, _port| 0);
        assert!(table.get(17).is_some());
    }
}
