//! Entry change notification interface.

use std::sync::Arc;

use crate::core::Value;

pub const NOTIFY_NEW: u32 = 0x01;
pub const NOTIFY_DELETE: u32 = 0x02;
pub const NOTIFY_UPDATE: u32 = 0x04;
pub const NOTIFY_FLAGS: u32 = 0x08;
/// Initial notification for listeners registered with immediate delivery.
pub const NOTIFY_IMMEDIATE: u32 = 0x80;
/// The change originated in this process.
pub const NOTIFY_LOCAL: u32 = 0x100;

/// What a listener callback receives.
#[derive(Clone, Debug)]
pub struct EntryNotification {
    pub local_id: usize,
    pub name: String,
    pub value: Value,
    pub flags: u32,
}

pub type ListenerCallback = Arc<dyn Fn(&EntryNotification) + Send + Sync>;

/// Notification fan-out. Implementations are internally threadsafe and only
/// enqueue; storage calls [`Notifier::notify_entry`] with its lock held.
pub trait Notifier: Send + Sync {
    /// Whether any local (non-polled) listeners exist. Lets hot paths skip
    /// building notifications nobody will see.
    fn local_notifiers(&self) -> bool;

    fn notify_entry(
        &self,
        local_id: usize,
        name: &str,
        value: &Value,
        flags: u32,
        only_listener: Option<usize>,
    );

    fn add_listener(&self, callback: ListenerCallback, prefix: &str, flags: u32) -> usize;
    fn add_entry_listener(&self, callback: ListenerCallback, local_id: usize, flags: u32)
    -> usize;
    fn add_polled_listener(&self, poller_uid: usize, prefix: &str, flags: u32) -> usize;
    fn add_polled_entry_listener(&self, poller_uid: usize, local_id: usize, flags: u32) -> usize;
}
