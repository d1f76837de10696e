//! In-memory presence and fanout registry.
//!
//! Tracks which users currently hold a live realtime connection and which
//! connections have joined which group scopes. Delivery is line-rate: events
//! are pushed into each connection's unbounded channel and the socket task
//! drains it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::events::ServerEvent;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live connection: a process-unique id plus the sender half
/// of its outbound event channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }

    /// Push an event to this connection. A closed channel means the socket
    /// task already exited; the event is dropped silently.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}

#[derive(Default)]
struct Registry {
    /// user_id -> the user's single live connection.
    users: HashMap<String, ConnectionHandle>,
    /// group conversation_id -> conn_id -> handle.
    groups: HashMap<String, HashMap<u64, ConnectionHandle>>,
}

/// Shared presence registry. Cheaply cloneable.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a user to a connection. A later registration for the same user
    /// replaces the earlier one (last connect wins); the displaced handle is
    /// returned so the caller can decide what to do with the old socket.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.users.insert(user_id.to_string(), handle)
    }

    /// Remove a user's binding, but only if it still points at this
    /// connection. Returns true when the mapping was removed. The guard keeps
    /// a stale disconnect from a replaced connection from unbinding the
    /// replacement.
    pub fn unregister(&self, conn_id: u64) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let user_id = inner
            .users
            .iter()
            .find(|(_, handle)| handle.conn_id == conn_id)
            .map(|(user_id, _)| user_id.clone());
        if let Some(ref user_id) = user_id {
            inner.users.remove(user_id);
        }
        for members in inner.groups.values_mut() {
            members.remove(&conn_id);
        }
        inner.groups.retain(|_, members| !members.is_empty());
        user_id
    }

    /// Look up the live connection for a user, if any.
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.users.get(user_id).cloned()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.users.contains_key(user_id)
    }

    /// Add a connection to a group scope. Joining twice is a no-op.
    pub fn join_group(&self, group_id: &str, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(handle.conn_id, handle);
    }

    /// Remove a connection from a group scope.
    pub fn leave_group(&self, group_id: &str, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = inner.groups.get_mut(group_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                inner.groups.remove(group_id);
            }
        }
    }

    /// All handles currently joined to a group scope, the sender's own
    /// connection included.
    pub fn group_handles(&self, group_id: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .groups
            .get(group_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live connections. Test and logging helper.
    pub fn online_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.users.len()
    }
}
