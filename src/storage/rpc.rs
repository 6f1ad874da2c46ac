//! RPC coordination: definitions live in the table, calls flow through the
//! injected handler (server) or the wire (client), and results rendezvous
//! under the storage mutex.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use crate::core::value::now;
use crate::core::{Message, UNASSIGNED_ID, Value};
use crate::rpc::SendResponseFn;
use crate::storage::Storage;
use crate::transport::ConnectionInfo;

/// Why a result wait ended without a result.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RpcResultError {
    #[error("timed out waiting for RPC result")]
    TimedOut,
    /// The wait was cancelled, the call pair is already being waited on,
    /// the result isn't there on a no-wait poll, or storage is terminating.
    #[error("RPC result wait cancelled")]
    Cancelled,
}

impl Storage {
    /// Install (or refresh) an RPC definition on an entry. The definition is
    /// a value, so peers learn about it like any other assignment.
    pub fn create_rpc(&self, local_id: usize, def: impl Into<Bytes>, rpc_uid: usize) {
        let core = &self.core;
        let mut inner = core.lock();
        if local_id >= inner.table.entries.len() {
            return;
        }

        let value = Value::rpc(def.into());
        let old_value = inner.table.entries[local_id].value.replace(value.clone());
        inner.table.entries[local_id].rpc_uid = Some(rpc_uid);

        if let Some(old) = &old_value {
            if *old == value {
                return; // same definition; nothing to announce
            }
        }

        if inner.table.entries[local_id].id == UNASSIGNED_ID {
            inner.table.assign_next_id(local_id);
        }

        let Some(dispatcher) = inner.dispatcher.clone() else {
            return;
        };
        let type_changed = match &old_value {
            None => true,
            Some(old) => old.entry_type() != value.entry_type(),
        };
        let entry = &mut inner.table.entries[local_id];
        entry.seq_num.increment();
        let msg = if type_changed {
            Message::EntryAssign {
                name: entry.name.clone(),
                id: entry.id,
                seq_num: entry.seq_num,
                value,
                flags: entry.flags,
            }
        } else {
            Message::EntryUpdate {
                id: entry.id,
                seq_num: entry.seq_num,
                value,
            }
        };
        drop(inner);
        dispatcher.queue_outgoing(msg, None, None);
    }

    /// Invoke an RPC. On the server the handler runs through the injected
    /// `RpcHandler` and the result lands in the local results map; on a
    /// client an ExecuteRpc goes out. Returns the call uid, or 0 if the
    /// entry isn't a callable RPC.
    pub fn call_rpc(&self, local_id: usize, params: &str) -> u16 {
        let core = &self.core;
        let mut inner = core.lock();
        if local_id >= inner.table.entries.len() {
            return 0;
        }
        {
            let entry = &inner.table.entries[local_id];
            if !entry.value.as_ref().is_some_and(Value::is_rpc) {
                return 0;
            }
        }

        let entry = &mut inner.table.entries[local_id];
        entry.rpc_call_uid = entry.rpc_call_uid.wrapping_add(1);
        let call_uid = entry.rpc_call_uid;
        let name = entry.name.clone();
        let id = entry.id;

        if inner.server {
            // Local invocation on the server: the response callback stores
            // the result and wakes any waiter.
            let rpc_uid = inner.table.entries[local_id].rpc_uid;
            drop(inner);
            let conn_info = ConnectionInfo {
                remote_id: "Server".to_string(),
                remote_ip: "localhost".to_string(),
                remote_port: 0,
                last_update: now(),
                protocol_version: 0x0300,
            };
            let shared = Arc::clone(core);
            let send_response: SendResponseFn = Box::new(move |result: String| {
                let mut inner = shared.lock();
                inner.rpc_results.insert((local_id, call_uid), result);
                shared.rpc_results_cond.notify_all();
            });
            core.rpc_handler.process_rpc(
                local_id,
                call_uid,
                &name,
                params,
                &conn_info,
                send_response,
                rpc_uid,
            );
        } else {
            let dispatcher = inner.dispatcher.clone();
            drop(inner);
            if let Some(dispatcher) = dispatcher {
                dispatcher.queue_outgoing(
                    Message::ExecuteRpc {
                        id,
                        call_uid,
                        params: params.to_string(),
                    },
                    None,
                    None,
                );
            }
        }
        call_uid
    }

    /// Block until the result for `(local_id, call_uid)` arrives.
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` polls without blocking.
    /// Only one blocking wait per call pair is allowed; a second concurrent
    /// wait returns cancelled immediately.
    pub fn get_rpc_result(
        &self,
        local_id: usize,
        call_uid: u16,
        timeout: Option<Duration>,
    ) -> Result<String, RpcResultError> {
        let core = &self.core;
        let mut inner = core.lock();
        let pair = (local_id, call_uid);

        if !inner.rpc_blocking_calls.insert(pair) {
            return Err(RpcResultError::Cancelled);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(result) = inner.rpc_results.remove(&pair) {
                inner.rpc_blocking_calls.remove(&pair);
                return Ok(result);
            }

            if timeout.is_some_and(|t| t.is_zero()) || self.terminating() {
                inner.rpc_blocking_calls.remove(&pair);
                return Err(RpcResultError::Cancelled);
            }

            inner = match deadline {
                None => core
                    .rpc_results_cond
                    .wait(inner)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let (mut guard, wait) = core
                        .rpc_results_cond
                        .wait_timeout(inner, remaining)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    if wait.timed_out() {
                        guard.rpc_blocking_calls.remove(&pair);
                        return Err(RpcResultError::TimedOut);
                    }
                    guard
                }
            };

            // Pair removed from the blocking set means we were cancelled.
            if !inner.rpc_blocking_calls.contains(&pair) {
                return Err(RpcResultError::Cancelled);
            }
            if self.terminating() {
                inner.rpc_blocking_calls.remove(&pair);
                return Err(RpcResultError::Cancelled);
            }
        }
    }

    /// Abort a pending result wait; the blocked caller returns cancelled.
    pub fn cancel_rpc_result(&self, local_id: usize, call_uid: u16) {
        let mut inner = self.core.lock();
        inner.rpc_blocking_calls.remove(&(local_id, call_uid));
        self.core.rpc_results_cond.notify_all();
    }

    fn terminating(&self) -> bool {
        self.core
            .terminating
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}
