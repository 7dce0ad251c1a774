//! Connection table with per-user and per-room indexes.
//!
//! All four tables (connections, users, rooms, heartbeats) live behind one
//! mutex so every register/unregister is applied as a unit and readers
//! never observe a half-applied change. The lock is never held across an
//! `.await`; transports are closed only after the entry has been removed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use vitals_core::ConnectionId;

use crate::transport::{CloseReason, Transport, close_quietly};

/// Snapshot of one live connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Handle.
    pub id: ConnectionId,
    /// Owner.
    pub user_id: String,
    /// Display name supplied at connect time.
    pub username: String,
    /// Room joined at connect time.
    pub room_id: Option<String>,
    /// Wall-clock registration time.
    pub connected_at: DateTime<Utc>,
    /// Last liveness signal from the peer.
    pub last_heartbeat: Instant,
}

/// Summary of a user's live connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    /// The user.
    pub user_id: String,
    /// Display name of the most recently registered connection.
    pub username: String,
    /// Number of live connections.
    pub connections: usize,
}

/// A delivery target resolved from the indexes.
#[derive(Clone)]
pub struct Target {
    /// Connection handle.
    pub id: ConnectionId,
    /// Its transport.
    pub transport: Arc<dyn Transport>,
}

/// A connection taken out of the registry, waiting to be closed.
pub struct Removed {
    /// Handle.
    pub id: ConnectionId,
    /// Owner.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Room it belonged to.
    pub room_id: Option<String>,
    transport: Arc<dyn Transport>,
}

impl Removed {
    /// Close the transport and record the removal.
    pub async fn retire(self, reason: CloseReason) {
        info!(
            conn_id = %self.id,
            user_id = %self.user_id,
            room_id = self.room_id.as_deref(),
            %reason,
            "connection removed"
        );
        counter!(crate::metrics::WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str())
            .increment(1);
        close_quietly(self.transport.as_ref(), &self.id, reason).await;
    }
}

/// Result of [`ConnectionRegistry::register`].
pub struct Registration {
    /// Handle of the admitted connection.
    pub id: ConnectionId,
    /// The user's oldest connection, removed to stay within quota.
    pub evicted: Option<Removed>,
}

struct Entry {
    user_id: String,
    username: String,
    room_id: Option<String>,
    connected_at: DateTime<Utc>,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct Indexes {
    connections: HashMap<ConnectionId, Entry>,
    /// Oldest first.
    by_user: HashMap<String, Vec<ConnectionId>>,
    by_room: HashMap<String, HashSet<ConnectionId>>,
    heartbeats: HashMap<ConnectionId, Instant>,
}

impl Indexes {
    fn insert(&mut self, id: ConnectionId, entry: Entry, now: Instant) {
        self.by_user
            .entry(entry.user_id.clone())
            .or_default()
            .push(id.clone());
        if let Some(room) = &entry.room_id {
            let _ = self.by_room.entry(room.clone()).or_default().insert(id.clone());
        }
        let _ = self.heartbeats.insert(id.clone(), now);
        let _ = self.connections.insert(id, entry);
    }

    fn remove(&mut self, id: &ConnectionId) -> Option<Removed> {
        let entry = self.connections.remove(id)?;
        let _ = self.heartbeats.remove(id);

        if let Some(ids) = self.by_user.get_mut(&entry.user_id) {
            ids.retain(|c| c != id);
            if ids.is_empty() {
                let _ = self.by_user.remove(&entry.user_id);
            }
        }
        if let Some(room) = &entry.room_id {
            if let Some(members) = self.by_room.get_mut(room) {
                let _ = members.remove(id);
                if members.is_empty() {
                    let _ = self.by_room.remove(room);
                }
            }
        }

        Some(Removed {
            id: id.clone(),
            user_id: entry.user_id,
            username: entry.username,
            room_id: entry.room_id,
            transport: entry.transport,
        })
    }

    fn target(&self, id: &ConnectionId) -> Option<Target> {
        self.connections.get(id).map(|e| Target {
            id: id.clone(),
            transport: Arc::clone(&e.transport),
        })
    }

    fn targets<'a>(&self, ids: impl IntoIterator<Item = &'a ConnectionId>) -> Vec<Target> {
        ids.into_iter().filter_map(|id| self.target(id)).collect()
    }
}

/// Live connections indexed by id, user, and room.
pub struct ConnectionRegistry {
    max_connections_per_user: usize,
    inner: Mutex<Indexes>,
}

impl ConnectionRegistry {
    /// Empty registry admitting at most `max_connections_per_user` live
    /// connections per user.
    pub fn new(max_connections_per_user: usize) -> Self {
        Self {
            max_connections_per_user: max_connections_per_user.max(1),
            inner: Mutex::new(Indexes::default()),
        }
    }

    /// Admit a connection, evicting the user's oldest one if at quota.
    ///
    /// Eviction and admission happen in the same critical section, so two
    /// concurrent registrations for one user cannot both slip under the
    /// quota. The evicted transport is left open for the caller to retire.
    pub fn register(
        &self,
        transport: Arc<dyn Transport>,
        user_id: String,
        username: String,
        room_id: Option<String>,
    ) -> Registration {
        let id = ConnectionId::new();
        let entry = Entry {
            user_id,
            username,
            room_id,
            connected_at: Utc::now(),
            transport,
        };

        let (evicted, total) = {
            let mut inner = self.inner.lock();
            let oldest = inner
                .by_user
                .get(&entry.user_id)
                .filter(|ids| ids.len() >= self.max_connections_per_user)
                .and_then(|ids| ids.first().cloned());
            let evicted = oldest.and_then(|old| inner.remove(&old));
            inner.insert(id.clone(), entry, Instant::now());
            (evicted, inner.connections.len())
        };

        counter!(crate::metrics::WS_CONNECTIONS_TOTAL).increment(1);
        if let Some(old) = &evicted {
            warn!(
                conn_id = %old.id,
                user_id = %old.user_id,
                limit = self.max_connections_per_user,
                "connection quota reached, evicting oldest connection"
            );
            counter!(crate::metrics::WS_EVICTIONS_TOTAL).increment(1);
        }
        set_active_gauge(total);

        Registration { id, evicted }
    }

    /// Remove a connection from every index. Absent ids yield `None`.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Removed> {
        let (removed, total) = {
            let mut inner = self.inner.lock();
            let removed = inner.remove(id);
            (removed, inner.connections.len())
        };
        if removed.is_some() {
            set_active_gauge(total);
        }
        removed
    }

    /// Remove every connection silent for longer than `timeout`.
    pub fn remove_stale(&self, now: Instant, timeout: Duration) -> Vec<Removed> {
        let (removed, total) = {
            let mut inner = self.inner.lock();
            let stale: Vec<ConnectionId> = inner
                .heartbeats
                .iter()
                .filter(|(_, last)| now.saturating_duration_since(**last) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            let removed: Vec<Removed> = stale.iter().filter_map(|id| inner.remove(id)).collect();
            (removed, inner.connections.len())
        };
        if !removed.is_empty() {
            set_active_gauge(total);
        }
        removed
    }

    /// Remove everything.
    pub fn drain(&self) -> Vec<Removed> {
        let removed: Vec<Removed> = {
            let mut inner = self.inner.lock();
            let ids: Vec<ConnectionId> = inner.connections.keys().cloned().collect();
            ids.iter().filter_map(|id| inner.remove(id)).collect()
        };
        set_active_gauge(0);
        removed
    }

    /// Refresh the liveness stamp. Returns the owner for live connections.
    pub fn touch(&self, id: &ConnectionId, now: Instant) -> Option<String> {
        let mut inner = self.inner.lock();
        let last = inner.heartbeats.get_mut(id)?;
        *last = now;
        inner.connections.get(id).map(|e| e.user_id.clone())
    }

    /// Live connections.
    pub fn count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Distinct users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.inner.lock().by_user.len()
    }

    /// Distinct users with a connection in `room_id`.
    pub fn room_users(&self, room_id: &str) -> BTreeSet<String> {
        let inner = self.inner.lock();
        inner
            .by_room
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id))
            .map(|e| e.user_id.clone())
            .collect()
    }

    /// Summary for `user_id`, named after their newest connection.
    pub fn user_info(&self, user_id: &str) -> Option<UserInfo> {
        let inner = self.inner.lock();
        let ids = inner.by_user.get(user_id)?;
        let newest = inner.connections.get(ids.last()?)?;
        Some(UserInfo {
            user_id: user_id.to_owned(),
            username: newest.username.clone(),
            connections: ids.len(),
        })
    }

    /// Snapshot of one connection.
    pub fn connection_info(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let inner = self.inner.lock();
        let entry = inner.connections.get(id)?;
        Some(ConnectionInfo {
            id: id.clone(),
            user_id: entry.user_id.clone(),
            username: entry.username.clone(),
            room_id: entry.room_id.clone(),
            connected_at: entry.connected_at,
            last_heartbeat: *inner.heartbeats.get(id)?,
        })
    }

    /// Every live connection.
    pub fn targets_all(&self) -> Vec<Target> {
        let inner = self.inner.lock();
        inner.targets(inner.connections.keys())
    }

    /// Connections in `room_id`.
    pub fn targets_room(&self, room_id: &str) -> Vec<Target> {
        let inner = self.inner.lock();
        inner.targets(inner.by_room.get(room_id).into_iter().flatten())
    }

    /// Connections owned by `user_id`.
    pub fn targets_user(&self, user_id: &str) -> Vec<Target> {
        let inner = self.inner.lock();
        inner.targets(inner.by_user.get(user_id).into_iter().flatten())
    }

    /// A single connection.
    pub fn target(&self, id: &ConnectionId) -> Option<Target> {
        self.inner.lock().target(id)
    }
}

#[allow(clippy::cast_precision_loss)]
fn set_active_gauge(total: usize) {
    gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).set(total as f64);
}
