//! Shared type definitions for the Parlor reading-session hub.
//!
//! This crate is the single source of truth for the types that cross crate
//! boundaries and the wire. Types flow to `TypeScript` via `ts-rs` for the
//! web client.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers (users, sessions, connections, ledger rows)
//! - [`enums`] -- Roles, session kind/mode/status, ledger accounts
//! - [`structs`] -- Identities, reading sessions, settlement ledger rows
//! - [`protocol`] -- Signaling socket frames

pub mod enums;
pub mod ids;
pub mod protocol;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{LedgerAccount, Role, SessionKind, SessionMode, SessionStatus, UnknownVariant};
pub use ids::{ConnectionId, LedgerEntryId, SessionId, UserId};
pub use protocol::{EnvelopeHeader, MessageKind, ServerFrame, SettlementPathKind};
pub use structs::{
    Identity, PRESENCE_CHANNEL, ReadingSession, SettlementEntry, session_channel,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // Files are written to `bindings/` relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::UserId::export_all();
        let _ = crate::ids::SessionId::export_all();
        let _ = crate::ids::ConnectionId::export_all();
        let _ = crate::ids::LedgerEntryId::export_all();

        let _ = crate::enums::Role::export_all();
        let _ = crate::enums::SessionKind::export_all();
        let _ = crate::enums::SessionMode::export_all();
        let _ = crate::enums::SessionStatus::export_all();
        let _ = crate::enums::LedgerAccount::export_all();

        let _ = crate::structs::Identity::export_all();
        let _ = crate::structs::ReadingSession::export_all();
        let _ = crate::structs::SettlementEntry::export_all();

        let _ = crate::protocol::SettlementPathKind::export_all();
        let _ = crate::protocol::ServerFrame::export_all();
    }
}
