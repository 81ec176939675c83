//! `PostgreSQL` store backend.
//!
//! Status changes are compare-and-set `UPDATE ... WHERE status = ANY(..)`
//! statements that skip rows claimed by a settlement (`settling`).
//! Settlement runs in a single transaction that locks the
//! session row, debits the client with a guarded
//! `account_balance >= total` update, credits the provider, inserts the
//! ledger legs and completes the session. Any early return drops the
//! transaction, which rolls it back.

use chrono::{DateTime, Utc};
use parlor_ledger::Payer;
use parlor_types::{
    Identity, LedgerAccount, ReadingSession, SessionId, SessionStatus, SettlementEntry, UserId,
};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::DbError;
use crate::model::{
    SessionFilter, SettleResult, SettledSession, SettlementCommand, Transition, TransitionResult,
};
use crate::postgres::PostgresPool;

/// Column list shared by every session query.
const SESSION_COLUMNS: &str = "id, provider_id, client_id, kind, mode, price_per_minute, status, \
     scheduled_for, started_at, completed_at, duration_seconds, total_cost, provider_share, \
     platform_share, payment_ref, cancel_reason, created_at";

/// Store backed by `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PostgresPool,
}

impl PgStore {
    /// Wrap a connected pool.
    pub const fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        self.pool.pool()
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Identities
    // -----------------------------------------------------------------------

    /// Fetch a user.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is corrupt.
    pub async fn get_identity(&self, id: UserId) -> Result<Option<Identity>, DbError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, display_name, role, is_online, account_balance FROM users WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool())
        .await?;
        row.map(Identity::try_from).transpose()
    }

    /// Insert a user record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Duplicate`] if the id is taken.
    pub async fn insert_identity(&self, identity: &Identity) -> Result<(), DbError> {
        let inserted = sqlx::query(
            "INSERT INTO users (id, display_name, role, is_online, account_balance)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(identity.id.into_inner())
        .bind(&identity.display_name)
        .bind(identity.role.as_str())
        .bind(identity.is_online)
        .bind(identity.account_balance)
        .execute(self.pool())
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(DbError::Duplicate {
                entity: "user",
                id: identity.id.into_inner(),
            });
        }
        Ok(())
    }

    /// Set a user's presence flag.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown user.
    pub async fn set_online(&self, id: UserId, online: bool) -> Result<(), DbError> {
        let updated = sqlx::query("UPDATE users SET is_online = $2 WHERE id = $1")
            .bind(id.into_inner())
            .bind(online)
            .execute(self.pool())
            .await?;
        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound {
                entity: "user",
                id: id.into_inner(),
            });
        }
        Ok(())
    }

    /// Add `amount` to a user's balance and return the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown user.
    pub async fn credit_balance(&self, id: UserId, amount: i64) -> Result<i64, DbError> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET account_balance = account_balance + $2
             WHERE id = $1 RETURNING account_balance",
        )
        .bind(id.into_inner())
        .bind(amount)
        .fetch_optional(self.pool())
        .await?;
        balance.ok_or(DbError::NotFound {
            entity: "user",
            id: id.into_inner(),
        })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    pub async fn insert_session(&self, session: &ReadingSession) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO reading_sessions
                (id, provider_id, client_id, kind, mode, price_per_minute, status,
                 scheduled_for, payment_ref, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(session.id.into_inner())
        .bind(session.provider_id.into_inner())
        .bind(session.client_id.into_inner())
        .bind(session.kind.as_str())
        .bind(session.mode.as_str())
        .bind(session.price_per_minute)
        .bind(session.status.as_str())
        .bind(session.scheduled_for)
        .bind(session.payment_ref.as_deref())
        .bind(session.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch a session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is corrupt.
    pub async fn get_session(&self, id: SessionId) -> Result<Option<ReadingSession>, DbError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM reading_sessions WHERE id = $1"
        ))
        .bind(id.into_inner())
        .fetch_optional(self.pool())
        .await?;
        row.map(ReadingSession::try_from).transpose()
    }

    /// List sessions matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is corrupt.
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<ReadingSession>, DbError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM reading_sessions
             WHERE ($1::UUID IS NULL OR client_id = $1 OR provider_id = $1)
               AND ($2::UUID IS NULL OR client_id = $2)
               AND ($3::UUID IS NULL OR provider_id = $3)
               AND ($4::TEXT IS NULL OR status = $4)
             ORDER BY created_at DESC"
        ))
        .bind(filter.party.map(UserId::into_inner))
        .bind(filter.client_id.map(UserId::into_inner))
        .bind(filter.provider_id.map(UserId::into_inner))
        .bind(filter.status.map(SessionStatus::as_str))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ReadingSession::try_from).collect()
    }

    /// Compare-and-set a session's status.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is corrupt.
    pub async fn transition(
        &self,
        id: SessionId,
        transition: &Transition,
    ) -> Result<TransitionResult, DbError> {
        let allowed: Vec<&str> = transition
            .allowed_from
            .iter()
            .copied()
            .map(SessionStatus::as_str)
            .collect();
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE reading_sessions
             SET status = $2,
                 started_at = COALESCE($3, started_at),
                 payment_ref = COALESCE($4, payment_ref),
                 cancel_reason = COALESCE($5, cancel_reason)
             WHERE id = $1 AND status = ANY($6) AND NOT settling
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id.into_inner())
        .bind(transition.to.as_str())
        .bind(transition.started_at)
        .bind(transition.payment_ref.as_deref())
        .bind(transition.cancel_reason.as_deref())
        .bind(&allowed)
        .fetch_optional(self.pool())
        .await?;

        self.applied_or_conflict(id, row).await
    }

    /// Claim an `in_progress` session for settlement.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is corrupt.
    pub async fn claim_settlement(&self, id: SessionId) -> Result<TransitionResult, DbError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE reading_sessions SET settling = TRUE
             WHERE id = $1 AND status = 'in_progress' AND NOT settling
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id.into_inner())
        .fetch_optional(self.pool())
        .await?;
        self.applied_or_conflict(id, row).await
    }

    /// Drop a settlement claim.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn release_settlement(&self, id: SessionId) -> Result<(), DbError> {
        sqlx::query("UPDATE reading_sessions SET settling = FALSE WHERE id = $1")
            .bind(id.into_inner())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Map a CAS `UPDATE ... RETURNING` to its outcome, reading the current
    /// status when no row matched.
    async fn applied_or_conflict(
        &self,
        id: SessionId,
        row: Option<SessionRow>,
    ) -> Result<TransitionResult, DbError> {
        if let Some(row) = row {
            return Ok(TransitionResult::Applied(ReadingSession::try_from(row)?));
        }
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM reading_sessions WHERE id = $1")
                .bind(id.into_inner())
                .fetch_optional(self.pool())
                .await?;
        match current {
            Some(status) => Ok(TransitionResult::Conflict(parse_enum(&status)?)),
            None => Ok(TransitionResult::NotFound),
        }
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Apply a settlement in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a conservation anomaly, a missing provider or
    /// a database failure. The transaction is rolled back in every
    /// non-`Settled` case.
    pub async fn settle(&self, command: &SettlementCommand) -> Result<SettleResult, DbError> {
        command.check_conservation()?;
        let mut tx = self.pool().begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM reading_sessions WHERE id = $1 FOR UPDATE")
                .bind(command.session_id.into_inner())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(SettleResult::NotFound);
        };
        let current: SessionStatus = parse_enum(&current)?;
        if current != SessionStatus::InProgress {
            return Ok(SettleResult::Conflict(current));
        }

        let total = command.amounts.total;
        let new_client_balance = match command.payer {
            Payer::Client(client_id) => match debit(&mut tx, client_id, total).await? {
                Debit::Applied(balance) => Some(balance),
                Debit::Insufficient(balance) => {
                    return Ok(SettleResult::InsufficientFunds {
                        balance,
                        required: total,
                    });
                }
            },
            Payer::Gateway => None,
        };

        let new_provider_balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET account_balance = account_balance + $2
             WHERE id = $1 RETURNING account_balance",
        )
        .bind(command.provider_id.into_inner())
        .bind(command.amounts.provider)
        .fetch_optional(&mut *tx)
        .await?;
        let new_provider_balance = new_provider_balance.ok_or(DbError::NotFound {
            entity: "user",
            id: command.provider_id.into_inner(),
        })?;

        for entry in &command.entries {
            insert_entry(&mut tx, entry).await?;
        }

        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE reading_sessions
             SET status = 'completed', settling = FALSE, completed_at = $2,
                 duration_seconds = $3, total_cost = $4, provider_share = $5,
                 platform_share = $6
             WHERE id = $1
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(command.session_id.into_inner())
        .bind(command.completed_at)
        .bind(i64::from(command.duration_seconds))
        .bind(command.amounts.total)
        .bind(command.amounts.provider)
        .bind(command.amounts.platform)
        .fetch_one(&mut *tx)
        .await?;
        let session = ReadingSession::try_from(row)?;

        tx.commit().await?;
        tracing::debug!(session_id = %command.session_id, total, "settlement committed");

        Ok(SettleResult::Settled(SettledSession {
            session,
            new_client_balance,
            new_provider_balance,
        }))
    }

    /// Ledger legs recorded for a session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is corrupt.
    pub async fn ledger_for_session(
        &self,
        id: SessionId,
    ) -> Result<Vec<SettlementEntry>, DbError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT id, session_id, from_account, from_user, to_account, to_user, amount, created_at
             FROM settlement_ledger WHERE session_id = $1 ORDER BY created_at",
        )
        .bind(id.into_inner())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(SettlementEntry::try_from).collect()
    }
}

enum Debit {
    Applied(i64),
    Insufficient(i64),
}

/// Guarded debit: succeeds only if the balance covers `amount`.
async fn debit(
    tx: &mut Transaction<'_, Postgres>,
    client_id: UserId,
    amount: i64,
) -> Result<Debit, DbError> {
    let applied: Option<i64> = sqlx::query_scalar(
        "UPDATE users SET account_balance = account_balance - $2
         WHERE id = $1 AND account_balance >= $2
         RETURNING account_balance",
    )
    .bind(client_id.into_inner())
    .bind(amount)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(balance) = applied {
        return Ok(Debit::Applied(balance));
    }
    let balance: Option<i64> = sqlx::query_scalar("SELECT account_balance FROM users WHERE id = $1")
        .bind(client_id.into_inner())
        .fetch_optional(&mut **tx)
        .await?;
    balance.map(Debit::Insufficient).ok_or(DbError::NotFound {
        entity: "user",
        id: client_id.into_inner(),
    })
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &SettlementEntry,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO settlement_ledger
            (id, session_id, from_account, from_user, to_account, to_user, amount, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(entry.id.into_inner())
    .bind(entry.session_id.into_inner())
    .bind(entry.from_account.as_str())
    .bind(entry.from_user.map(UserId::into_inner))
    .bind(entry.to_account.as_str())
    .bind(entry.to_user.map(UserId::into_inner))
    .bind(entry.amount)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

fn parse_enum<T>(value: &str) -> Result<T, DbError>
where
    T: core::str::FromStr<Err = parlor_types::UnknownVariant>,
{
    value.parse().map_err(|e: parlor_types::UnknownVariant| DbError::Decode(e.to_string()))
}

/// A row from the `users` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    /// User id.
    pub id: Uuid,
    /// Display name.
    pub display_name: String,
    /// Role name.
    pub role: String,
    /// Presence flag.
    pub is_online: bool,
    /// Balance in minor units.
    pub account_balance: i64,
}

impl TryFrom<UserRow> for Identity {
    type Error = DbError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: UserId(row.id),
            display_name: row.display_name,
            role: parse_enum(&row.role)?,
            is_online: row.is_online,
            account_balance: row.account_balance,
        })
    }
}

/// A row from the `reading_sessions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    /// Session id.
    pub id: Uuid,
    /// Provider id.
    pub provider_id: Uuid,
    /// Client id.
    pub client_id: Uuid,
    /// Kind name.
    pub kind: String,
    /// Mode name.
    pub mode: String,
    /// Price per minute.
    pub price_per_minute: i64,
    /// Status name.
    pub status: String,
    /// Booked start.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Live since.
    pub started_at: Option<DateTime<Utc>>,
    /// Settled at.
    pub completed_at: Option<DateTime<Utc>>,
    /// Billed duration.
    pub duration_seconds: Option<i64>,
    /// Frozen cost.
    pub total_cost: Option<i64>,
    /// Provider share.
    pub provider_share: Option<i64>,
    /// Platform share.
    pub platform_share: Option<i64>,
    /// Gateway payment reference.
    pub payment_ref: Option<String>,
    /// Cancellation reason.
    pub cancel_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for ReadingSession {
    type Error = DbError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let duration_seconds = row
            .duration_seconds
            .map(u32::try_from)
            .transpose()
            .map_err(|e| DbError::Decode(format!("duration_seconds: {e}")))?;
        Ok(Self {
            id: SessionId(row.id),
            provider_id: UserId(row.provider_id),
            client_id: UserId(row.client_id),
            kind: parse_enum(&row.kind)?,
            mode: parse_enum(&row.mode)?,
            price_per_minute: row.price_per_minute,
            status: parse_enum(&row.status)?,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_seconds,
            total_cost: row.total_cost,
            provider_share: row.provider_share,
            platform_share: row.platform_share,
            payment_ref: row.payment_ref,
            cancel_reason: row.cancel_reason,
            created_at: row.created_at,
        })
    }
}

/// A row from the `settlement_ledger` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    /// Row id.
    pub id: Uuid,
    /// Settled session.
    pub session_id: Uuid,
    /// Debited account name.
    pub from_account: String,
    /// Debited user.
    pub from_user: Option<Uuid>,
    /// Credited account name.
    pub to_account: String,
    /// Credited user.
    pub to_user: Option<Uuid>,
    /// Amount moved.
    pub amount: i64,
    /// Timestamp.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for SettlementEntry {
    type Error = DbError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let from_account: LedgerAccount = parse_enum(&row.from_account)?;
        let to_account: LedgerAccount = parse_enum(&row.to_account)?;
        Ok(Self {
            id: row.id.into(),
            session_id: SessionId(row.session_id),
            from_account,
            from_user: row.from_user.map(UserId),
            to_account,
            to_user: row.to_user.map(UserId),
            amount: row.amount,
            created_at: row.created_at,
        })
    }
}
