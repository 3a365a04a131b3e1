// SQLite ledger of observed payment attempts.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::status::{CheckoutRequestId, PaymentStatus};

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub checkout_request_id: String,
    pub status: PaymentStatus,
    pub amount: Option<String>,
    pub transaction_id: Option<String>,
    pub message: Option<String>,
    pub checks: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// SQLite-backed record of every attempt this client has watched and the
/// status it last observed. Terminal rows are never overwritten.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the ledger at `path`. Pass `":memory:"` for an
    /// ephemeral database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS payment_attempts (
                checkout_request_id TEXT PRIMARY KEY,
                status              TEXT NOT NULL DEFAULT 'pending',
                amount              TEXT,
                transaction_id      TEXT,
                message             TEXT,
                checks              INTEGER NOT NULL DEFAULT 0,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_payment_attempts_status
                ON payment_attempts(status, updated_at);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself intact.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an attempt as pending. Re-registering an existing ID is a
    /// no-op, so resumed attempts keep their history.
    pub fn record_attempt(&self, id: &CheckoutRequestId, amount: Option<&str>) -> Result<()> {
        let now = now_rfc3339();
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO payment_attempts
                    (checkout_request_id, status, amount, created_at, updated_at)
                 VALUES (?1, 'pending', ?2, ?3, ?3)",
                params![id.as_str(), amount, now],
            )
            .context("failed to record payment attempt")?;
        Ok(())
    }

    /// Store the latest observation for `id`.
    ///
    /// Returns `false` (and changes nothing) when the row is already
    /// terminal. Missing rows are created.
    pub fn record_status(
        &self,
        id: &CheckoutRequestId,
        status: PaymentStatus,
        transaction_id: Option<&str>,
        message: Option<&str>,
        checks: u32,
    ) -> Result<bool> {
        let now = now_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO payment_attempts
                (checkout_request_id, status, created_at, updated_at)
             VALUES (?1, 'pending', ?2, ?2)",
            params![id.as_str(), now],
        )
        .context("failed to ensure payment attempt row")?;

        let changed = conn
            .execute(
                "UPDATE payment_attempts
                 SET status = ?2,
                     transaction_id = COALESCE(?3, transaction_id),
                     message = COALESCE(?4, message),
                     checks = ?5,
                     updated_at = ?6
                 WHERE checkout_request_id = ?1 AND status = 'pending'",
                params![id.as_str(), status.as_str(), transaction_id, message, checks, now],
            )
            .context("failed to update payment status")?;

        Ok(changed > 0)
    }

    pub fn get_attempt(&self, id: &CheckoutRequestId) -> Result<Option<AttemptRecord>> {
        self.conn()
            .query_row(
                "SELECT checkout_request_id, status, amount, transaction_id, message, checks,
                        created_at, updated_at
                 FROM payment_attempts WHERE checkout_request_id = ?1",
                params![id.as_str()],
                map_record,
            )
            .optional()
            .context("failed to load payment attempt")
    }

    /// All attempts still pending, most recently touched first.
    pub fn pending_attempts(&self) -> Result<Vec<AttemptRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT checkout_request_id, status, amount, transaction_id, message, checks,
                        created_at, updated_at
                 FROM payment_attempts WHERE status = 'pending'
                 ORDER BY updated_at DESC, rowid DESC",
            )
            .context("failed to prepare pending_attempts query")?;

        let rows = stmt
            .query_map([], map_record)
            .context("failed to query pending attempts")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map payment attempt rows")?;

        Ok(rows)
    }

    /// The attempt to resume after an unclean exit, if any.
    pub fn latest_pending(&self) -> Result<Option<AttemptRecord>> {
        Ok(self.pending_attempts()?.into_iter().next())
    }
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<AttemptRecord> {
    let status: String = row.get(1)?;
    Ok(AttemptRecord {
        checkout_request_id: row.get(0)?,
        status: PaymentStatus::parse(&status),
        amount: row.get(2)?,
        transaction_id: row.get(3)?,
        message: row.get(4)?,
        checks: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
