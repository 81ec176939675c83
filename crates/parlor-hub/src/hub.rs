//! The hub object every transport handler is given.
//!
//! [`Hub`] wires the registry, router, presence publisher, session machine
//! and settlement engine over one [`Store`] and one [`PaymentGateway`].
//! There is no global state: the server holds an `Arc<Hub>` and passes it
//! to each handler.

use std::sync::Arc;

use parlor_db::Store;
use parlor_types::{ConnectionId, Identity, Role, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HubConfig, ParlorConfig, SeedUser};
use crate::error::HubError;
use crate::gateway::PaymentGateway;
use crate::presence::PresencePublisher;
use crate::registry::Registry;
use crate::router::SignalingRouter;
use crate::sessions::SessionMachine;
use crate::settlement::SettlementEngine;

/// Shared state of the reading-session hub.
#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    store: Store,
    registry: Arc<Registry>,
    presence: PresencePublisher,
    router: SignalingRouter,
    sessions: SessionMachine,
}

impl Hub {
    /// Build a hub from its collaborators and configuration.
    pub fn new(store: Store, gateway: PaymentGateway, config: &ParlorConfig) -> Self {
        Self::assemble(store, gateway, config, None)
    }

    /// Like [`new`](Self::new), also fanning presence out over NATS.
    pub fn with_nats(
        store: Store,
        gateway: PaymentGateway,
        config: &ParlorConfig,
        nats: async_nats::Client,
    ) -> Self {
        Self::assemble(store, gateway, config, Some(nats))
    }

    fn assemble(
        store: Store,
        gateway: PaymentGateway,
        config: &ParlorConfig,
        nats: Option<async_nats::Client>,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.hub.outbound_queue));
        let mut presence = PresencePublisher::new(store.clone(), Arc::clone(&registry));
        if let Some(client) = nats {
            presence = presence.with_nats(client);
        }
        let router = SignalingRouter::new(
            Arc::clone(&registry),
            store.clone(),
            presence.clone(),
            config.routing.legacy_broadcast,
        );
        let engine = SettlementEngine::new(store.clone(), gateway.clone(), &config.settlement);
        let sessions = SessionMachine::new(
            store.clone(),
            Arc::clone(&registry),
            engine,
            gateway,
            config.settlement.cancel_on_insufficient_funds,
        );
        info!(
            store = store.backend(),
            legacy_broadcast = config.routing.legacy_broadcast,
            "hub assembled"
        );
        Self {
            config: config.hub.clone(),
            store,
            registry,
            presence,
            router,
            sessions,
        }
    }

    /// Connection settings.
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The backing store.
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// The connection registry.
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The presence publisher.
    pub const fn presence(&self) -> &PresencePublisher {
        &self.presence
    }

    /// The session state machine.
    pub const fn sessions(&self) -> &SessionMachine {
        &self.sessions
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Accept a new transport connection.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        self.registry.register().await
    }

    /// Handle one inbound text frame.
    pub async fn receive(&self, handle: ConnectionId, text: &str) {
        self.router.route(handle, text).await;
    }

    /// Record non-text activity (pong, binary) on a connection.
    pub async fn touch(&self, handle: ConnectionId) {
        self.registry.touch(handle).await;
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn disconnect(&self, handle: ConnectionId) {
        if let Some(departure) = self.registry.unregister(handle).await {
            self.router.departed(departure).await;
        }
    }

    /// Unregister every connection idle for longer than the idle timeout.
    /// Returns how many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let idle = self.registry.idle_handles(self.config.idle_timeout()).await;
        for handle in &idle {
            debug!(handle = %handle, "reaping idle connection");
            self.disconnect(*handle).await;
        }
        if !idle.is_empty() {
            info!(count = idle.len(), "idle connections reaped");
        }
        idle.len()
    }

    /// Run [`reap_idle`](Self::reap_idle) on the configured interval until
    /// the task is aborted.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.reap_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                hub.reap_idle().await;
            }
        })
    }

    // -----------------------------------------------------------------------
    // Identities
    // -----------------------------------------------------------------------

    /// Resolve a caller id to its identity.
    pub async fn caller(&self, user_id: UserId) -> Result<Identity, HubError> {
        self.store
            .get_identity(user_id)
            .await?
            .ok_or(HubError::Unauthenticated)
    }

    /// Providers with at least one live connection.
    pub async fn online_providers(&self) -> Result<Vec<Identity>, HubError> {
        let mut providers = Vec::new();
        for user_id in self.registry.online_users(Some(Role::Provider)).await {
            if let Some(identity) = self.store.get_identity(user_id).await? {
                providers.push(identity);
            }
        }
        Ok(providers)
    }

    /// Credit `amount` to `user_id`'s balance. Admin only.
    pub async fn top_up(
        &self,
        caller: &Identity,
        user_id: UserId,
        amount: i64,
    ) -> Result<i64, HubError> {
        if !caller.is_admin() {
            return Err(HubError::Forbidden(format!(
                "user {} may not top up balances",
                caller.id
            )));
        }
        if amount <= 0 {
            return Err(HubError::Validation("amount must be positive".to_owned()));
        }
        if self.store.get_identity(user_id).await?.is_none() {
            return Err(HubError::user_not_found(user_id));
        }
        let balance = self.store.credit_balance(user_id, amount).await?;
        info!(user_id = %user_id, amount, balance, admin = %caller.id, "balance topped up");
        Ok(balance)
    }

    /// Insert configured seed users, skipping ids that already exist.
    /// Returns how many were inserted.
    pub async fn seed(&self, users: &[SeedUser]) -> Result<usize, HubError> {
        let mut inserted: usize = 0;
        for user in users {
            if self.store.get_identity(user.id).await?.is_some() {
                debug!(user_id = %user.id, "seed user already present");
                continue;
            }
            if user.balance < 0 {
                warn!(user_id = %user.id, balance = user.balance, "seed user with negative balance skipped");
                continue;
            }
            self.store
                .insert_identity(Identity {
                    id: user.id,
                    display_name: user.display_name.clone(),
                    role: user.role,
                    is_online: false,
                    account_balance: user.balance,
                })
                .await?;
            inserted = inserted.saturating_add(1);
        }
        if inserted > 0 {
            info!(count = inserted, "seed users inserted");
        }
        Ok(inserted)
    }
}
