//! RPC execution interface.
//!
//! RPC definitions live in the table as values; execution is delegated to an
//! injected handler so storage never blocks on user callbacks.

use crate::transport::ConnectionInfo;

/// Invoked by the handler (possibly on another thread) to deliver the result
/// of one call. Dropping it without calling is allowed; the caller's wait
/// then ends in a timeout or cancellation.
pub type SendResponseFn = Box<dyn FnOnce(String) + Send>;

/// One pending RPC invocation as seen by handler callbacks.
#[derive(Clone, Debug)]
pub struct RpcAnswer {
    pub local_id: usize,
    pub call_uid: u16,
    pub name: String,
    pub params: String,
    pub conn: ConnectionInfo,
}

pub trait RpcHandler: Send + Sync {
    /// Hand one call to the registered procedure. `rpc_uid` identifies the
    /// local handler registration, `None` when the definition arrived over
    /// the network without one; `send_response` must be invoked (or dropped)
    /// exactly once.
    #[allow(clippy::too_many_arguments)]
    fn process_rpc(
        &self,
        local_id: usize,
        call_uid: u16,
        name: &str,
        params: &str,
        conn: &ConnectionInfo,
        send_response: SendResponseFn,
        rpc_uid: Option<usize>,
    );

    /// The entry backing this registration was deleted.
    fn remove_rpc(&self, rpc_uid: usize);
}
