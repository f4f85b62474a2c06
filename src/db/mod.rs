//! SQLite store for the scope tree, users, assets and custody ledgers
//!
//! ## Tables
//!
//! - `departments`, `locations`, `rooms` - the scope tree (parent pointers)
//! - `users`, `role_assignments` - identities and their role bindings
//! - `equipment`, `equipment_assignments`, `equipment_events`
//! - `accessories`, `accessory_assignments`, `accessory_events`
//! - `consumables`, `consumable_issues`, `consumable_events`
//! - `audit_log` - write-once actor/target/scope snapshots
//!
//! Event tables and the audit log reject UPDATE and DELETE through triggers.
//!
//! ## Transactions
//!
//! [`CustodyDb::with_tx`] opens a `BEGIN IMMEDIATE` transaction, so the
//! database write lock is held before the first row is read. Repository
//! functions named `lock_*` must only be called inside such a transaction;
//! what they return is the state every business rule is validated against.

pub mod schema;
pub mod scope_tree;
pub mod users;
pub mod equipment;
pub mod accessories;
pub mod consumables;
pub mod audit;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CustodyError;

/// SQLite database handle shared by the services
pub struct CustodyDb {
    conn: Mutex<Connection>,
}

impl CustodyDb {
    /// Open or create the custody database at `path`
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, CustodyError> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a custody transaction holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(busy_timeout)?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, CustodyError> {
        debug!("Opening in-memory SQLite database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CustodyError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, CustodyError>
    where
        F: FnOnce(&Connection) -> Result<T, CustodyError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CustodyError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls the whole transaction
    /// back, including audit rows written through it.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, CustodyError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, CustodyError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CustodyError::Internal(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Current timestamp in the format stored in every `*_at` column
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Open/closed flag carried by every custody row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustodyState {
    Open,
    Closed,
}

impl CustodyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustodyState::Open => "open",
            CustodyState::Closed => "closed",
        }
    }
}

impl FromSql for CustodyState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "open" => Ok(CustodyState::Open),
            "closed" => Ok(CustodyState::Closed),
            other => Err(FromSqlError::Other(
                format!("unknown custody state: {}", other).into(),
            )),
        }
    }
}

impl ToSql for CustodyState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// Ledger event types. Each event table accepts the subset its CHECK lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Assigned,
    Returned,
    StatusChanged,
    Issued,
    Used,
    Lost,
    Damaged,
    Expired,
    Condemned,
    Restocked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Assigned => "assigned",
            EventType::Returned => "returned",
            EventType::StatusChanged => "status_changed",
            EventType::Issued => "issued",
            EventType::Used => "used",
            EventType::Lost => "lost",
            EventType::Damaged => "damaged",
            EventType::Expired => "expired",
            EventType::Condemned => "condemned",
            EventType::Restocked => "restocked",
        }
    }

    pub fn parse(name: &str) -> Option<EventType> {
        [
            EventType::Assigned,
            EventType::Returned,
            EventType::StatusChanged,
            EventType::Issued,
            EventType::Used,
            EventType::Lost,
            EventType::Damaged,
            EventType::Expired,
            EventType::Condemned,
            EventType::Restocked,
        ]
        .into_iter()
        .find(|e| e.as_str() == name)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromSql for EventType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let name = value.as_str()?;
        EventType::parse(name)
            .ok_or_else(|| FromSqlError::Other(format!("unknown event type: {}", name).into()))
    }
}

impl ToSql for EventType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// Bind a dynamically built parameter list
pub(crate) fn param_refs(params: &[Box<dyn ToSql>]) -> Vec<&dyn ToSql> {
    params.iter().map(|p| p.as_ref()).collect()
}

/// Reject zero and negative quantities before any lock is taken
pub(crate) fn positive_quantity(quantity: i64) -> Result<i64, CustodyError> {
    if quantity <= 0 {
        return Err(CustodyError::invalid("quantity", "must be a positive integer"));
    }
    Ok(quantity)
}

/// Stock after adding `quantity` units, rejecting totals past `i64::MAX`
pub(crate) fn add_stock(current: i64, quantity: i64) -> Result<i64, CustodyError> {
    current
        .checked_add(quantity)
        .ok_or_else(|| CustodyError::invalid("quantity", "exceeds the maximum stock"))
}

/// Use the supplied public id or mint a fresh one
pub(crate) fn public_id_or_new(id: Option<String>) -> Result<String, CustodyError> {
    match id {
        Some(id) if id.trim().is_empty() => {
            Err(CustodyError::invalid("public_id", "must not be blank"))
        }
        Some(id) => Ok(id),
        None => Ok(uuid::Uuid::new_v4().to_string()),
    }
}

/// Map a UNIQUE constraint failure to an invalid-request error
pub(crate) fn unique_violation(e: rusqlite::Error, field: &'static str, reason: &str) -> CustodyError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CustodyError::invalid(field, reason)
        }
        other => other.into(),
    }
}
