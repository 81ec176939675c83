//! Connection registry: every live socket, who it belongs to and which
//! channels it listens on.
//!
//! Three indexes sit behind one [`RwLock`]: handle to connection, identity to
//! handles and channel to handles. Mutations take the write lock; fan-out
//! takes the read lock, so deliveries to different connections proceed
//! concurrently. Each connection owns a bounded outbound queue drained by its
//! socket task; a full queue drops the frame instead of blocking the sender.
//!
//! Operations on an unknown handle are no-ops logged at debug level, since a
//! closing socket routinely races with the idle reaper.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use parlor_types::{ConnectionId, Role, UserId};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// The identity a connection authenticated as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Bound user.
    pub user_id: UserId,
    /// Role at authentication time.
    pub role: Role,
}

/// A handle stopped representing an identity (unregister or re-bind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    /// The identity the handle was bound to.
    pub binding: Binding,
    /// Whether no other handle remains bound to that identity.
    pub last_for_identity: bool,
}

/// Result of [`Registry::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOutcome {
    /// Whether this is the only handle bound to the identity.
    pub first_for_identity: bool,
    /// The identity the handle was previously bound to, if it changed.
    pub replaced: Option<Departure>,
}

#[derive(Debug)]
struct Connection {
    outbound: mpsc::Sender<String>,
    binding: Option<Binding>,
    channels: BTreeSet<String>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Indexes {
    connections: BTreeMap<ConnectionId, Connection>,
    by_identity: BTreeMap<UserId, BTreeSet<ConnectionId>>,
    by_channel: BTreeMap<String, BTreeSet<ConnectionId>>,
}

impl Indexes {
    /// Remove `handle` from the identity index. Returns whether the identity
    /// has no handles left.
    fn unbind_identity(&mut self, user_id: UserId, handle: ConnectionId) -> bool {
        let Some(handles) = self.by_identity.get_mut(&user_id) else {
            return true;
        };
        handles.remove(&handle);
        if handles.is_empty() {
            self.by_identity.remove(&user_id);
            true
        } else {
            false
        }
    }

    fn leave_channel(&mut self, channel: &str, handle: ConnectionId) {
        if let Some(handles) = self.by_channel.get_mut(channel) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.by_channel.remove(channel);
            }
        }
    }
}

/// Shared registry of live connections.
#[derive(Debug)]
pub struct Registry {
    indexes: RwLock<Indexes>,
    queue_capacity: usize,
}

impl Registry {
    /// Create an empty registry whose connections buffer up to
    /// `queue_capacity` outbound frames each.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new anonymous connection. The returned receiver yields the
    /// frames to write to the socket and ends when the connection is
    /// unregistered.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let handle = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let connection = Connection {
            outbound: tx,
            binding: None,
            channels: BTreeSet::new(),
            last_seen: Instant::now(),
        };
        self.indexes
            .write()
            .await
            .connections
            .insert(handle, connection);
        debug!(handle = %handle, "connection registered");
        (handle, rx)
    }

    /// Bind `handle` to an identity. Re-binding is allowed and overwrites
    /// the previous binding with a warning. Returns `None` for an unknown
    /// handle.
    pub async fn bind(&self, handle: ConnectionId, binding: Binding) -> Option<BindOutcome> {
        let mut indexes = self.indexes.write().await;
        let Some(connection) = indexes.connections.get_mut(&handle) else {
            debug!(handle = %handle, "bind on unknown handle ignored");
            return None;
        };
        let previous = connection.binding.replace(binding);

        let replaced = match previous {
            Some(old) if old.user_id != binding.user_id => {
                warn!(
                    handle = %handle,
                    previous = %old.user_id,
                    user_id = %binding.user_id,
                    "connection re-bound to a different identity"
                );
                let last_for_identity = indexes.unbind_identity(old.user_id, handle);
                Some(Departure {
                    binding: old,
                    last_for_identity,
                })
            }
            Some(_) => {
                warn!(handle = %handle, user_id = %binding.user_id, "connection re-authenticated");
                None
            }
            None => None,
        };

        let handles = indexes.by_identity.entry(binding.user_id).or_default();
        handles.insert(handle);
        let first_for_identity = handles.len() == 1;

        Some(BindOutcome {
            first_for_identity,
            replaced,
        })
    }

    /// Add `handle` to `channel`. Returns `false` for an unknown handle.
    pub async fn subscribe(&self, handle: ConnectionId, channel: &str) -> bool {
        let mut indexes = self.indexes.write().await;
        let Some(connection) = indexes.connections.get_mut(&handle) else {
            debug!(handle = %handle, channel, "subscribe on unknown handle ignored");
            return false;
        };
        connection.channels.insert(channel.to_owned());
        indexes
            .by_channel
            .entry(channel.to_owned())
            .or_default()
            .insert(handle);
        true
    }

    /// Remove `handle` from `channel`. Returns `false` for an unknown handle.
    pub async fn unsubscribe(&self, handle: ConnectionId, channel: &str) -> bool {
        let mut indexes = self.indexes.write().await;
        let Some(connection) = indexes.connections.get_mut(&handle) else {
            debug!(handle = %handle, channel, "unsubscribe on unknown handle ignored");
            return false;
        };
        connection.channels.remove(channel);
        indexes.leave_channel(channel, handle);
        true
    }

    /// Remove `handle` from every index and close its outbound queue.
    ///
    /// Returns the departure of its identity if it was bound; `None` for an
    /// anonymous or unknown handle.
    pub async fn unregister(&self, handle: ConnectionId) -> Option<Departure> {
        let mut indexes = self.indexes.write().await;
        let Some(connection) = indexes.connections.remove(&handle) else {
            debug!(handle = %handle, "unregister on unknown handle ignored");
            return None;
        };
        for channel in &connection.channels {
            indexes.leave_channel(channel, handle);
        }
        debug!(handle = %handle, "connection unregistered");
        connection.binding.map(|binding| Departure {
            binding,
            last_for_identity: indexes.unbind_identity(binding.user_id, handle),
        })
    }

    /// Record activity on `handle`.
    pub async fn touch(&self, handle: ConnectionId) {
        let mut indexes = self.indexes.write().await;
        if let Some(connection) = indexes.connections.get_mut(&handle) {
            connection.last_seen = Instant::now();
        }
    }

    /// Handles silent for longer than `timeout`.
    pub async fn idle_handles(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.indexes
            .read()
            .await
            .connections
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_seen) > timeout)
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Handles bound to `user_id`.
    pub async fn lookup(&self, user_id: UserId) -> BTreeSet<ConnectionId> {
        self.indexes
            .read()
            .await
            .by_identity
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Handles subscribed to `channel`.
    pub async fn lookup_by_channel(&self, channel: &str) -> BTreeSet<ConnectionId> {
        self.indexes
            .read()
            .await
            .by_channel
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// The identity `handle` is bound to.
    pub async fn identity_of(&self, handle: ConnectionId) -> Option<Binding> {
        self.indexes
            .read()
            .await
            .connections
            .get(&handle)
            .and_then(|c| c.binding)
    }

    /// Identities with at least one bound handle, optionally filtered by role.
    pub async fn online_users(&self, role: Option<Role>) -> Vec<UserId> {
        let indexes = self.indexes.read().await;
        let mut users: BTreeSet<UserId> = BTreeSet::new();
        for binding in indexes.connections.values().filter_map(|c| c.binding) {
            if role.is_none_or(|r| r == binding.role) {
                users.insert(binding.user_id);
            }
        }
        users.into_iter().collect()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.indexes.read().await.connections.len()
    }

    /// Whether no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.indexes.read().await.connections.is_empty()
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Queue `text` on one connection. Returns whether it was queued.
    pub async fn send(&self, handle: ConnectionId, text: &str) -> bool {
        let indexes = self.indexes.read().await;
        match indexes.connections.get(&handle) {
            Some(connection) => enqueue(handle, connection, text),
            None => {
                debug!(handle = %handle, "send to unknown handle dropped");
                false
            }
        }
    }

    /// Queue `text` on every connection bound to `user_id`. Returns the
    /// number of connections reached.
    pub async fn send_to_user(&self, user_id: UserId, text: &str) -> usize {
        let indexes = self.indexes.read().await;
        let Some(handles) = indexes.by_identity.get(&user_id) else {
            return 0;
        };
        fan_out(&indexes, handles.iter().copied(), text)
    }

    /// Queue `text` on every subscriber of `channel`.
    pub async fn send_to_channel(&self, channel: &str, text: &str) -> usize {
        let indexes = self.indexes.read().await;
        let Some(handles) = indexes.by_channel.get(channel) else {
            return 0;
        };
        fan_out(&indexes, handles.iter().copied(), text)
    }

    /// Queue `text` on every open connection.
    pub async fn broadcast(&self, text: &str) -> usize {
        let indexes = self.indexes.read().await;
        fan_out(&indexes, indexes.connections.keys().copied(), text)
    }
}

fn fan_out(
    indexes: &Indexes,
    handles: impl Iterator<Item = ConnectionId>,
    text: &str,
) -> usize {
    handles
        .filter(|handle| {
            indexes
                .connections
                .get(handle)
                .is_some_and(|c| enqueue(*handle, c, text))
        })
        .count()
}

fn enqueue(handle: ConnectionId, connection: &Connection, text: &str) -> bool {
    match connection.outbound.try_send(text.to_owned()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(handle = %handle, "outbound queue full, frame dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(handle = %handle, "outbound queue closed, frame dropped");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn client(user_id: UserId) -> Binding {
        Binding {
            user_id,
            role: Role::Client,
        }
    }

    #[tokio::test]
    async fn lookup_is_empty_after_unregister() {
        let registry = Registry::new(8);
        let user = UserId::new();
        let (a, _rx_a) = registry.register().await;
        let (b, _rx_b) = registry.register().await;

        let first = registry.bind(a, client(user)).await.unwrap();
        assert!(first.first_for_identity);
        let second = registry.bind(b, client(user)).await.unwrap();
        assert!(!second.first_for_identity);
        assert_eq!(registry.lookup(user).await.len(), 2);

        let gone = registry.unregister(a).await.unwrap();
        assert!(!gone.last_for_identity);
        let gone = registry.unregister(b).await.unwrap();
        assert!(gone.last_for_identity);
        assert!(registry.lookup(user).await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_handles_are_no_ops() {
        let registry = Registry::new(8);
        let ghost = ConnectionId::new();
        assert!(registry.bind(ghost, client(UserId::new())).await.is_none());
        assert!(!registry.subscribe(ghost, "presence").await);
        assert!(registry.unregister(ghost).await.is_none());
        assert!(!registry.send(ghost, "{}").await);
    }

    #[tokio::test]
    async fn rebind_moves_handle_between_identities() {
        let registry = Registry::new(8);
        let (handle, _rx) = registry.register().await;
        let (alice, bob) = (UserId::new(), UserId::new());
        registry.bind(handle, client(alice)).await.unwrap();

        // Same identity again: idempotent.
        let again = registry.bind(handle, client(alice)).await.unwrap();
        assert_eq!(again.replaced, None);
        assert_eq!(registry.lookup(alice).await.len(), 1);

        let moved = registry.bind(handle, client(bob)).await.unwrap();
        assert_eq!(
            moved.replaced.map(|d| (d.binding.user_id, d.last_for_identity)),
            Some((alice, true))
        );
        assert!(registry.lookup(alice).await.is_empty());
        assert_eq!(registry.identity_of(handle).await.map(|b| b.user_id), Some(bob));
    }

    #[tokio::test]
    async fn channel_delivery_reaches_subscribers_only() {
        let registry = Registry::new(8);
        let (a, mut rx_a) = registry.register().await;
        let (_b, mut rx_b) = registry.register().await;
        registry.subscribe(a, "session:x").await;

        assert_eq!(registry.send_to_channel("session:x", "hello").await, 1);
        assert_eq!(rx_a.recv().await.as_deref(), Some("hello"));
        assert!(rx_b.try_recv().is_err());

        registry.unsubscribe(a, "session:x").await;
        assert_eq!(registry.send_to_channel("session:x", "again").await, 0);
        assert!(registry.lookup_by_channel("session:x").await.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let registry = Registry::new(1);
        let (handle, mut rx) = registry.register().await;
        assert!(registry.send(handle, "one").await);
        assert!(!registry.send(handle, "two").await);
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert!(registry.send(handle, "three").await);
    }

    #[tokio::test]
    async fn unregister_closes_outbound_queue() {
        let registry = Registry::new(4);
        let (handle, mut rx) = registry.register().await;
        registry.unregister(handle).await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn online_users_filters_by_role() {
        let registry = Registry::new(4);
        let (a, _rx_a) = registry.register().await;
        let (b, _rx_b) = registry.register().await;
        let provider = UserId::new();
        registry
            .bind(
                a,
                Binding {
                    user_id: provider,
                    role: Role::Provider,
                },
            )
            .await;
        registry.bind(b, client(UserId::new())).await;
        assert_eq!(registry.online_users(Some(Role::Provider)).await, vec![provider]);
        assert_eq!(registry.online_users(None).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_handles_respects_touch() {
        let registry = Registry::new(4);
        let (quiet, _rx_q) = registry.register().await;
        let (chatty, _rx_c) = registry.register().await;
        tokio::time::advance(Duration::from_secs(90)).await;
        registry.touch(chatty).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(
            registry.idle_handles(Duration::from_secs(120)).await,
            vec![quiet]
        );
    }
}
