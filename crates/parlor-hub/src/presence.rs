//! Provider presence derived from connection churn.
//!
//! The registry reports when a provider's first handle binds and when its
//! last handle goes away. The publisher turns those edges into a store
//! update plus a `provider_presence` frame on the `presence` channel and,
//! when configured, a NATS message on `parlor.presence.<provider_id>`.
//!
//! Edges are observed under the registry lock but published after it is
//! released, so a page reload can deliver the old socket's offline edge
//! after the new socket's online edge. Publishes are therefore serialized,
//! and each one re-reads the registry and drops an edge that no longer
//! matches the live handles.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parlor_db::Store;
use parlor_types::{PRESENCE_CHANNEL, ServerFrame, UserId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::registry::Registry;

/// A provider came online or went offline; the NATS message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    /// The provider.
    pub provider_id: UserId,
    /// New state.
    pub is_online: bool,
    /// When the edge was observed.
    pub at: DateTime<Utc>,
}

/// Publishes provider presence.
#[derive(Debug, Clone)]
pub struct PresencePublisher {
    store: Store,
    registry: Arc<Registry>,
    /// Held for the whole of one publish.
    order: Arc<Mutex<()>>,
    nats: Option<async_nats::Client>,
}

impl PresencePublisher {
    /// Create a publisher without NATS fan-out.
    pub fn new(store: Store, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            order: Arc::new(Mutex::new(())),
            nats: None,
        }
    }

    /// Also publish every edge to NATS.
    #[must_use]
    pub fn with_nats(mut self, client: async_nats::Client) -> Self {
        self.nats = Some(client);
        self
    }

    /// Record and announce that `provider_id` is now `is_online`.
    ///
    /// An edge contradicted by the registry by the time it runs is dropped;
    /// the edge that changed the registry announces the current state. A
    /// store failure is logged and does not stop the announcement: the live
    /// view comes from the registry, the flag is a cached copy.
    pub async fn publish(&self, provider_id: UserId, is_online: bool) {
        let order = self.order.lock().await;
        self.publish_locked(provider_id, is_online).await;
        drop(order);
    }

    async fn publish_locked(&self, provider_id: UserId, is_online: bool) {
        let live = !self.registry.lookup(provider_id).await.is_empty();
        if live != is_online {
            debug!(provider_id = %provider_id, is_online, live, "stale presence edge dropped");
            return;
        }

        if let Err(e) = self.store.set_online(provider_id, is_online).await {
            error!(provider_id = %provider_id, error = %e, "failed to persist presence");
        }

        let frame = ServerFrame::ProviderPresence {
            provider_id,
            is_online,
        };
        match frame.to_text() {
            Ok(text) => {
                let reached = self.registry.send_to_channel(PRESENCE_CHANNEL, &text).await;
                debug!(provider_id = %provider_id, is_online, reached, "presence frame sent");
            }
            Err(e) => warn!(error = %e, "failed to serialize presence frame"),
        }

        let event = PresenceEvent {
            provider_id,
            is_online,
            at: Utc::now(),
        };
        self.publish_nats(&event);

        info!(provider_id = %provider_id, is_online, "provider presence changed");
    }

    /// Fire-and-forget NATS publication.
    fn publish_nats(&self, event: &PresenceEvent) {
        let Some(client) = &self.nats else {
            return;
        };
        let subject = format!("parlor.presence.{}", event.provider_id);
        match serde_json::to_vec(event) {
            Ok(payload) => {
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                        warn!(subject = subject, error = %e, "failed to publish presence");
                    }
                });
            }
            Err(e) => warn!(subject = subject, error = %e, "failed to serialize presence"),
        }
    }
}

/// Connect to NATS for presence fan-out.
///
/// # Errors
///
/// Returns [`HubError::Internal`] if the connection cannot be established.
pub async fn connect_nats(url: &str) -> Result<async_nats::Client, HubError> {
    info!(url = url, "connecting to NATS server");
    let client = async_nats::connect(url)
        .await
        .map_err(|e| HubError::Internal(format!("failed to connect to NATS at {url}: {e}")))?;
    info!("NATS connection established");
    Ok(client)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use parlor_types::{ConnectionId, Identity, Role};

    use super::*;
    use crate::registry::Binding;

    async fn provider_in(store: &Store) -> Identity {
        let provider = Identity {
            id: UserId::new(),
            display_name: "Vey".to_owned(),
            role: Role::Provider,
            is_online: false,
            account_balance: 0,
        };
        store.insert_identity(provider.clone()).await.unwrap();
        provider
    }

    async fn bound(registry: &Registry, user_id: UserId) -> ConnectionId {
        let (handle, _rx) = registry.register().await;
        registry
            .bind(handle, Binding {
                user_id,
                role: Role::Provider,
            })
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn publish_updates_store_and_presence_channel() {
        let store = Store::memory();
        let provider = provider_in(&store).await;
        let registry = Arc::new(Registry::new(8));
        let (watcher, mut rx) = registry.register().await;
        registry.subscribe(watcher, PRESENCE_CHANNEL).await;
        let (_bystander, mut other) = registry.register().await;
        bound(&registry, provider.id).await;

        let presence = PresencePublisher::new(store.clone(), Arc::clone(&registry));
        presence.publish(provider.id, true).await;

        let stored = store.get_identity(provider.id).await.unwrap().unwrap();
        assert!(stored.is_online);

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "provider_presence");
        assert_eq!(frame["isOnline"], true);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_offline_edge_after_reload_is_dropped() {
        let store = Store::memory();
        let provider = provider_in(&store).await;
        let registry = Arc::new(Registry::new(8));
        let (watcher, mut rx) = registry.register().await;
        registry.subscribe(watcher, PRESENCE_CHANNEL).await;
        let presence = PresencePublisher::new(store.clone(), Arc::clone(&registry));

        let old = bound(&registry, provider.id).await;
        presence.publish(provider.id, true).await;
        rx.recv().await.unwrap();

        // Old socket leaves, new socket binds, and only then does the old
        // socket's offline edge get published.
        let departure = registry.unregister(old).await.unwrap();
        assert!(departure.last_for_identity);
        bound(&registry, provider.id).await;
        presence.publish(provider.id, true).await;
        presence.publish(provider.id, false).await;

        assert!(store.get_identity(provider.id).await.unwrap().unwrap().is_online);
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["isOnline"], true);
        assert!(rx.try_recv().is_err());
    }
}
