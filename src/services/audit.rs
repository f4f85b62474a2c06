//! Audit sink
//!
//! Called inside the custody transaction, so a sink failure rolls the
//! mutation back with it.

use rusqlite::Connection;
use serde_json::Value;

use crate::auth::{AuthContext, RoomId};
use crate::db::{audit, scope_tree};
use crate::error::CustodyError;

/// What a committed mutation did, before actor and scope names are resolved
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: &'static str,
    pub target_kind: &'static str,
    pub target_public_id: String,
    pub target_name: String,
    pub room: Option<RoomId>,
    pub details: Value,
}

pub trait AuditSink: Send + Sync {
    /// Record `entry` on the transaction's connection
    fn record(&self, conn: &Connection, ctx: &AuthContext, entry: &AuditEntry) -> Result<(), CustodyError>;
}

/// Writes to the `audit_log` table
pub struct SqliteAuditSink;

impl AuditSink for SqliteAuditSink {
    fn record(&self, conn: &Connection, ctx: &AuthContext, entry: &AuditEntry) -> Result<(), CustodyError> {
        let names = scope_tree::scope_names(conn, entry.room)?;
        let details_json = if entry.details.is_null() {
            None
        } else {
            Some(entry.details.to_string())
        };

        audit::insert_audit_row(
            conn,
            &audit::NewAuditRow {
                action: entry.action.to_string(),
                actor_public_id: ctx.actor().public_id.clone(),
                actor_name: ctx.actor().display_name.clone(),
                target_kind: entry.target_kind.to_string(),
                target_public_id: entry.target_public_id.clone(),
                target_name: entry.target_name.clone(),
                room_name: names.room,
                location_name: names.location,
                department_name: names.department,
                details_json,
            },
        )
        .map_err(|e| CustodyError::AuditSink(e.to_string()))?;
        Ok(())
    }
}
