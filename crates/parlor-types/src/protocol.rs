//! Wire protocol of the signaling socket.
//!
//! Every frame is a JSON object with a `type` field and a free-form payload.
//! Inbound frames are kept as raw JSON so signaling payloads can be relayed
//! verbatim; only the routing fields are parsed, into [`EnvelopeHeader`].
//! Outbound frames the server originates are typed as [`ServerFrame`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::{ConnectionId, SessionId, UserId};
use crate::structs::ReadingSession;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Routing fields of an inbound frame. Everything else is payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    /// The raw `type` string.
    #[serde(rename = "type")]
    pub kind: String,
    /// Session the frame belongs to, if any.
    #[serde(default, alias = "session_id")]
    pub session_id: Option<SessionId>,
    /// Identity the sender claims to be.
    #[serde(default, alias = "sender_id")]
    pub sender_id: Option<UserId>,
    /// Unicast target.
    #[serde(default, alias = "recipient_id")]
    pub recipient_id: Option<UserId>,
    /// Identity named by `authenticate` and `join_session`.
    #[serde(default, alias = "user_id")]
    pub user_id: Option<UserId>,
    /// Channel named by `subscribe` / `unsubscribe`, or an explicit delivery scope.
    #[serde(default)]
    pub channel: Option<String>,
    /// Client timestamp echoed by `pong`.
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

/// Classification of an inbound `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Liveness probe answered with `pong`.
    Ping,
    /// Binds the connection to an identity.
    Authenticate,
    /// Joins a channel.
    Subscribe,
    /// Leaves a channel.
    Unsubscribe,
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// ICE candidate.
    IceCandidate,
    /// The media connection came up.
    CallConnected,
    /// The media connection was torn down.
    CallEnded,
    /// A peer announces it joined a session.
    JoinSession,
    /// In-session chat text.
    ChatMessage,
    /// Anything else.
    Other,
}

impl MessageKind {
    /// Classify a `type` string. Both `snake_case` and `kebab-case`
    /// spellings are accepted (`ice_candidate` and `ice-candidate`).
    pub fn classify(kind: &str) -> Self {
        let normalized = kind.replace('-', "_");
        match normalized.as_str() {
            "ping" => Self::Ping,
            "authenticate" => Self::Authenticate,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice_candidate" => Self::IceCandidate,
            "call_connected" => Self::CallConnected,
            "call_ended" => Self::CallEnded,
            "join_session" => Self::JoinSession,
            "chat_message" => Self::ChatMessage,
            _ => Self::Other,
        }
    }

    /// Whether this kind is peer-to-peer signaling addressed to a `recipientId`.
    pub const fn is_unicast_signaling(self) -> bool {
        matches!(
            self,
            Self::Offer | Self::Answer | Self::IceCandidate | Self::CallConnected | Self::CallEnded
        )
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Which payment path a settlement took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SettlementPathKind {
    /// Debited from the client's internal balance.
    Balance,
    /// Captured from a pre-authorized external payment.
    Gateway,
}

/// Frames the server originates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ServerFrame {
    /// Sent unsolicited right after the socket opens.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// The handle assigned to this connection.
        client_handle: ConnectionId,
        /// Server clock.
        server_time: DateTime<Utc>,
    },
    /// Answer to `ping`.
    #[serde(rename_all = "camelCase")]
    Pong {
        /// The client's timestamp, echoed.
        timestamp: Option<serde_json::Value>,
        /// Server clock.
        server_time: DateTime<Utc>,
    },
    /// The connection is now bound to `user_id`.
    #[serde(rename_all = "camelCase")]
    AuthenticationSuccess {
        /// The bound identity.
        user_id: UserId,
    },
    /// The connection joined `channel`.
    #[serde(rename_all = "camelCase")]
    SubscriptionSuccess {
        /// The channel.
        channel: String,
    },
    /// The connection left `channel`.
    #[serde(rename_all = "camelCase")]
    UnsubscriptionSuccess {
        /// The channel.
        channel: String,
    },
    /// A provider came online or went offline.
    #[serde(rename_all = "camelCase")]
    ProviderPresence {
        /// The provider.
        provider_id: UserId,
        /// New presence state.
        is_online: bool,
    },
    /// A session changed state.
    #[serde(rename_all = "camelCase")]
    SessionUpdated {
        /// The session after the transition.
        session: ReadingSession,
    },
    /// A session was settled.
    #[serde(rename_all = "camelCase")]
    SessionSettled {
        /// The session.
        session_id: SessionId,
        /// Frozen total cost.
        #[ts(type = "number")]
        total_cost: i64,
        /// Amount credited to the provider.
        #[ts(type = "number")]
        provider_share: i64,
        /// Amount kept by the platform.
        #[ts(type = "number")]
        platform_share: i64,
        /// Balance debit or gateway capture.
        path: SettlementPathKind,
        /// Client balance after the debit, for the balance path.
        #[ts(type = "number | null")]
        new_client_balance: Option<i64>,
    },
    /// Settlement was attempted and aborted without any mutation.
    #[serde(rename_all = "camelCase")]
    SettlementFailed {
        /// The session, which stays `in_progress` unless policy cancelled it.
        session_id: SessionId,
        /// Machine-readable reason (`insufficient_funds`, `gateway_error`, ...).
        reason: String,
        /// Missing amount for `insufficient_funds`.
        #[ts(type = "number | null")]
        shortfall: Option<i64>,
    },
}

impl ServerFrame {
    /// Serialize to the text form sent on the socket.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn classify_accepts_both_spellings() {
        assert_eq!(MessageKind::classify("ice_candidate"), MessageKind::IceCandidate);
        assert_eq!(MessageKind::classify("ice-candidate"), MessageKind::IceCandidate);
        assert_eq!(MessageKind::classify("join-session"), MessageKind::JoinSession);
        assert_eq!(MessageKind::classify("call_ended"), MessageKind::CallEnded);
        assert_eq!(MessageKind::classify("typing"), MessageKind::Other);
        assert!(MessageKind::Offer.is_unicast_signaling());
        assert!(!MessageKind::JoinSession.is_unicast_signaling());
    }

    #[test]
    fn header_reads_camel_case_routing_fields() {
        let recipient = UserId::new();
        let raw = serde_json::json!({
            "type": "offer",
            "recipientId": recipient,
            "payload": {"sdp": "v=0"}
        });
        let header: EnvelopeHeader = serde_json::from_value(raw).unwrap();
        assert_eq!(header.kind, "offer");
        assert_eq!(header.recipient_id, Some(recipient));
        assert!(header.session_id.is_none());
    }

    #[test]
    fn connected_frame_shape() {
        let handle = ConnectionId::new();
        let frame = ServerFrame::Connected {
            client_handle: handle,
            server_time: Utc::now(),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["clientHandle"], handle.to_string());
        assert!(value.get("serverTime").is_some());
    }

    #[test]
    fn settled_frame_uses_snake_case_path() {
        let frame = ServerFrame::SessionSettled {
            session_id: SessionId::new(),
            total_cost: 300,
            provider_share: 240,
            platform_share: 60,
            path: SettlementPathKind::Balance,
            new_client_balance: Some(200),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "session_settled");
        assert_eq!(value["path"], "balance");
        assert_eq!(value["newClientBalance"], 200);
    }
}
