//! Signaling router: decides where every inbound frame goes.
//!
//! Dispatch, in priority order:
//!
//! 1. `ping` answers `pong` to the sender only
//! 2. `authenticate` binds the connection and may flip provider presence
//! 3. `subscribe` / `unsubscribe` manage channel membership
//! 4. `offer`, `answer`, `ice_candidate`, `call_connected`, `call_ended`
//!    with a `recipientId` go verbatim to every connection of that identity
//! 5. `join_session` goes to every connection (the joining peer does not
//!    know the other party's handle yet) and subscribes the sender to the
//!    session channel
//! 6. everything else goes to the subscribers of `session:<sessionId>` or
//!    of an explicit `channel`, or to everyone with `legacy_broadcast`
//!
//! Delivery is fire-and-forget. Malformed frames and frames for offline
//! recipients are logged and dropped; the sender is never told.

use std::sync::Arc;

use chrono::Utc;
use parlor_db::Store;
use parlor_types::{
    ConnectionId, EnvelopeHeader, MessageKind, Role, ServerFrame, SessionId, UserId, session_channel,
};
use tracing::{debug, warn};

use crate::authz::{Action, is_allowed};
use crate::presence::PresencePublisher;
use crate::registry::{Binding, Departure, Registry};

/// Prefix of per-session channel names.
const SESSION_CHANNEL_PREFIX: &str = "session:";

/// Routes inbound frames.
#[derive(Debug, Clone)]
pub struct SignalingRouter {
    registry: Arc<Registry>,
    store: Store,
    presence: PresencePublisher,
    legacy_broadcast: bool,
}

impl SignalingRouter {
    /// Create a router.
    pub const fn new(
        registry: Arc<Registry>,
        store: Store,
        presence: PresencePublisher,
        legacy_broadcast: bool,
    ) -> Self {
        Self {
            registry,
            store,
            presence,
            legacy_broadcast,
        }
    }

    /// Route one text frame received on `handle`.
    pub async fn route(&self, handle: ConnectionId, text: &str) {
        self.registry.touch(handle).await;

        let header: EnvelopeHeader = match serde_json::from_str(text) {
            Ok(header) => header,
            Err(e) => {
                warn!(handle = %handle, error = %e, "malformed frame dropped");
                return;
            }
        };

        match MessageKind::classify(&header.kind) {
            MessageKind::Ping => {
                self.reply(handle, &ServerFrame::Pong {
                    timestamp: header.timestamp,
                    server_time: Utc::now(),
                })
                .await;
            }
            MessageKind::Authenticate => self.authenticate(handle, &header).await,
            MessageKind::Subscribe => self.subscribe(handle, &header).await,
            MessageKind::Unsubscribe => self.unsubscribe(handle, &header).await,
            kind if kind.is_unicast_signaling() && header.recipient_id.is_some() => {
                self.unicast(handle, &header, text).await;
            }
            MessageKind::JoinSession => self.join_session(handle, &header, text).await,
            _ => self.scoped(handle, &header, text).await,
        }
    }

    /// Announce a handle leaving: flips presence if it was a provider's last.
    pub async fn departed(&self, departure: Departure) {
        if departure.last_for_identity && departure.binding.role == Role::Provider {
            self.presence
                .publish(departure.binding.user_id, false)
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Control frames
    // -----------------------------------------------------------------------

    async fn authenticate(&self, handle: ConnectionId, header: &EnvelopeHeader) {
        let Some(user_id) = header.user_id.or(header.sender_id) else {
            debug!(handle = %handle, "authenticate without userId ignored");
            return;
        };
        let identity = match self.store.get_identity(user_id).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                debug!(handle = %handle, user_id = %user_id, "authenticate for unknown user ignored");
                return;
            }
            Err(e) => {
                warn!(handle = %handle, user_id = %user_id, error = %e, "identity lookup failed");
                return;
            }
        };

        let binding = Binding {
            user_id,
            role: identity.role,
        };
        let Some(outcome) = self.registry.bind(handle, binding).await else {
            return;
        };
        self.reply(handle, &ServerFrame::AuthenticationSuccess { user_id }).await;

        if let Some(departure) = outcome.replaced {
            self.departed(departure).await;
        }
        if outcome.first_for_identity && identity.is_provider() {
            self.presence.publish(user_id, true).await;
        }
    }

    async fn subscribe(&self, handle: ConnectionId, header: &EnvelopeHeader) {
        let Some(channel) = header.channel.as_deref().filter(|c| !c.is_empty()) else {
            debug!(handle = %handle, "subscribe without channel ignored");
            return;
        };
        if !self.may_join(handle, channel).await {
            warn!(handle = %handle, channel, "subscription to session channel refused");
            return;
        }
        if self.registry.subscribe(handle, channel).await {
            self.reply(handle, &ServerFrame::SubscriptionSuccess {
                channel: channel.to_owned(),
            })
            .await;
        }
    }

    async fn unsubscribe(&self, handle: ConnectionId, header: &EnvelopeHeader) {
        let Some(channel) = header.channel.as_deref() else {
            debug!(handle = %handle, "unsubscribe without channel ignored");
            return;
        };
        if self.registry.unsubscribe(handle, channel).await {
            self.reply(handle, &ServerFrame::UnsubscriptionSuccess {
                channel: channel.to_owned(),
            })
            .await;
        }
    }

    // -----------------------------------------------------------------------
    // Relayed frames
    // -----------------------------------------------------------------------

    async fn unicast(&self, handle: ConnectionId, header: &EnvelopeHeader, text: &str) {
        let Some(sender) = self.verified_sender(handle, header).await else {
            return;
        };
        if let Some(session_id) = header.session_id {
            if !self.session_exists(session_id).await {
                debug!(handle = %handle, session_id = %session_id, "signaling for unknown session dropped");
                return;
            }
        }
        let Some(recipient) = header.recipient_id else {
            return;
        };
        let reached = self.registry.send_to_user(recipient, text).await;
        if reached == 0 {
            debug!(
                kind = header.kind.as_str(),
                sender = %sender,
                recipient = %recipient,
                "recipient offline, signaling dropped"
            );
        }
    }

    async fn join_session(&self, handle: ConnectionId, header: &EnvelopeHeader, text: &str) {
        if let Some(session_id) = header.session_id {
            if !self.session_exists(session_id).await {
                debug!(handle = %handle, session_id = %session_id, "join for unknown session dropped");
                return;
            }
            let channel = session_channel(session_id);
            if self.may_join(handle, &channel).await {
                self.registry.subscribe(handle, &channel).await;
            }
        }
        let reached = self.registry.broadcast(text).await;
        debug!(handle = %handle, reached, "join_session broadcast");
    }

    async fn scoped(&self, handle: ConnectionId, header: &EnvelopeHeader, text: &str) {
        if self.legacy_broadcast {
            self.registry.broadcast(text).await;
            return;
        }
        if let Some(session_id) = header.session_id {
            if !self.session_exists(session_id).await {
                debug!(handle = %handle, session_id = %session_id, "frame for unknown session dropped");
                return;
            }
        }
        let channel = header
            .channel
            .clone()
            .or_else(|| header.session_id.map(session_channel));
        match channel {
            Some(channel) => {
                let reached = self.registry.send_to_channel(&channel, text).await;
                debug!(handle = %handle, kind = header.kind.as_str(), channel, reached, "frame delivered to channel");
            }
            None => debug!(handle = %handle, kind = header.kind.as_str(), "unscoped frame dropped"),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// The bound identity of `handle`, provided it matches any claimed `senderId`.
    async fn verified_sender(&self, handle: ConnectionId, header: &EnvelopeHeader) -> Option<UserId> {
        let Some(binding) = self.registry.identity_of(handle).await else {
            debug!(handle = %handle, kind = header.kind.as_str(), "signaling from unauthenticated connection dropped");
            return None;
        };
        match header.sender_id {
            Some(claimed) if claimed != binding.user_id => {
                warn!(
                    handle = %handle,
                    claimed = %claimed,
                    bound = %binding.user_id,
                    "signaling with mismatched senderId dropped"
                );
                None
            }
            _ => Some(binding.user_id),
        }
    }

    /// Session channels are open to the session's parties and admins only.
    async fn may_join(&self, handle: ConnectionId, channel: &str) -> bool {
        let Some(raw) = channel.strip_prefix(SESSION_CHANNEL_PREFIX) else {
            return true;
        };
        let Ok(session_id) = raw.parse::<SessionId>() else {
            return false;
        };
        let Some(binding) = self.registry.identity_of(handle).await else {
            return false;
        };
        let (caller, session) = match (
            self.store.get_identity(binding.user_id).await,
            self.store.get_session(session_id).await,
        ) {
            (Ok(Some(caller)), Ok(Some(session))) => (caller, session),
            _ => return false,
        };
        is_allowed(&caller, &session, Action::View)
    }

    async fn session_exists(&self, id: SessionId) -> bool {
        match self.store.get_session(id).await {
            Ok(session) => session.is_some(),
            Err(e) => {
                warn!(session_id = %id, error = %e, "session lookup failed");
                false
            }
        }
    }

    async fn reply(&self, handle: ConnectionId, frame: &ServerFrame) {
        match frame.to_text() {
            Ok(text) => {
                self.registry.send(handle, &text).await;
            }
            Err(e) => warn!(handle = %handle, error = %e, "failed to serialize reply"),
        }
    }
}
