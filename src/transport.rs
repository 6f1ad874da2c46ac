//! Transport-facing collaborator traits.
//!
//! Storage never owns the network stack. The dispatcher and per-connection
//! handles are injected so outgoing messages can be queued without taking
//! transport locks, breaking the storage/dispatcher dependency cycle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::Message;

/// Connection lifecycle as seen by the storage engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Init,
    Handshake,
    Synchronized,
    Dead,
}

/// Snapshot of a peer connection, handed to RPC handlers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub remote_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    /// Last time any update arrived from the peer, storage clock scale.
    pub last_update: u64,
    /// Protocol layer format: 0x0200 = 2.0, 0x0300 = 3.0.
    pub protocol_version: u16,
}

/// One live peer connection.
pub trait NetworkConnection: Send + Sync {
    fn proto_rev(&self) -> u16;
    fn set_state(&self, state: ConnectionState);
    fn info(&self) -> ConnectionInfo;
    /// Queue a message on this connection only.
    fn queue_outgoing(&self, msg: Message);
}

/// Outbound message fan-out.
///
/// `only` restricts delivery to a single connection; `except` excludes one
/// (used when the server re-broadcasts a peer's own write). Both `None`
/// means every synchronized connection.
pub trait Dispatcher: Send + Sync {
    fn queue_outgoing(
        &self,
        msg: Message,
        only: Option<&Arc<dyn NetworkConnection>>,
        except: Option<&Arc<dyn NetworkConnection>>,
    );
}
