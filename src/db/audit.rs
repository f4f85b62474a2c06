//! Write-once audit log
//!
//! Rows carry names rather than foreign keys so they outlive the actor,
//! the asset and the scope nodes they describe.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::now;
use crate::error::CustodyError;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub action: String,
    pub actor_public_id: String,
    pub actor_name: String,
    pub target_kind: String,
    pub target_public_id: String,
    pub target_name: String,
    pub room_name: Option<String>,
    pub location_name: Option<String>,
    pub department_name: Option<String>,
    pub details_json: Option<String>,
    pub occurred_at: String,
}

impl AuditRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            action: row.get("action")?,
            actor_public_id: row.get("actor_public_id")?,
            actor_name: row.get("actor_name")?,
            target_kind: row.get("target_kind")?,
            target_public_id: row.get("target_public_id")?,
            target_name: row.get("target_name")?,
            room_name: row.get("room_name")?,
            location_name: row.get("location_name")?,
            department_name: row.get("department_name")?,
            details_json: row.get("details_json")?,
            occurred_at: row.get("occurred_at")?,
        })
    }
}

/// Snapshot to append
#[derive(Debug, Clone, Default)]
pub struct NewAuditRow {
    pub action: String,
    pub actor_public_id: String,
    pub actor_name: String,
    pub target_kind: String,
    pub target_public_id: String,
    pub target_name: String,
    pub room_name: Option<String>,
    pub location_name: Option<String>,
    pub department_name: Option<String>,
    pub details_json: Option<String>,
}

pub fn insert_audit_row(conn: &Connection, entry: &NewAuditRow) -> Result<String, CustodyError> {
    let public_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO audit_log
            (public_id, action, actor_public_id, actor_name, target_kind, target_public_id, target_name,
             room_name, location_name, department_name, details_json, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            public_id,
            entry.action,
            entry.actor_public_id,
            entry.actor_name,
            entry.target_kind,
            entry.target_public_id,
            entry.target_name,
            entry.room_name,
            entry.location_name,
            entry.department_name,
            entry.details_json,
            now()
        ],
    )?;
    Ok(public_id)
}

/// Audit trail for one target, oldest first
pub fn list_for_target(
    conn: &Connection,
    target_kind: &str,
    target_public_id: &str,
) -> Result<Vec<AuditRow>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM audit_log WHERE target_kind = ? AND target_public_id = ? ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![target_kind, target_public_id], AuditRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count(conn: &Connection) -> Result<i64, CustodyError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?)
}
