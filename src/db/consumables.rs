//! Consumable registry and issuance ledger
//!
//! `consumables.quantity` is the stock on the shelf. Issued units leave the
//! stock at issue time; a `consumable_issues` row tracks what the holder
//! still has (`quantity`) against what they were given (`issued_quantity`).

use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{now, param_refs, public_id_or_new, unique_violation, CustodyState, EventType};
use crate::auth::{EntityKind, RoomId, ScopeFilter};
use crate::error::CustodyError;

/// Consumable row from database
#[derive(Debug, Clone, Serialize)]
pub struct ConsumableRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub name: String,
    pub unit: Option<String>,
    pub quantity: i64,
    pub low_stock_threshold: i64,
    #[serde(skip)]
    pub room_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl ConsumableRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            name: row.get("name")?,
            unit: row.get("unit")?,
            quantity: row.get("quantity")?,
            low_stock_threshold: row.get("low_stock_threshold")?,
            room_id: row.get("room_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn room(&self) -> Option<RoomId> {
        self.room_id.map(RoomId)
    }

    pub fn is_low_stock(&self) -> bool {
        self.quantity <= self.low_stock_threshold
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumableIssueRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    #[serde(skip)]
    pub consumable_id: i64,
    #[serde(skip)]
    pub holder_id: i64,
    pub quantity: i64,
    pub issued_quantity: i64,
    #[serde(skip)]
    pub assigned_by: Option<i64>,
    pub purpose: Option<String>,
    pub issued_at: String,
    pub returned_at: Option<String>,
    pub state: CustodyState,
}

impl ConsumableIssueRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            consumable_id: row.get("consumable_id")?,
            holder_id: row.get("holder_id")?,
            quantity: row.get("quantity")?,
            issued_quantity: row.get("issued_quantity")?,
            assigned_by: row.get("assigned_by")?,
            purpose: row.get("purpose")?,
            issued_at: row.get("issued_at")?,
            returned_at: row.get("returned_at")?,
            state: row.get("state")?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == CustodyState::Open
    }
}

/// Input for registering a consumable
#[derive(Debug, Clone, Deserialize)]
pub struct CreateConsumableInput {
    #[serde(default)]
    pub public_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub low_stock_threshold: i64,
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumableListing {
    #[serde(flatten)]
    pub consumable: ConsumableRow,
    pub room: Option<String>,
    pub is_low_stock: bool,
}

#[derive(Debug, Clone)]
pub struct NewConsumableEvent<'a> {
    pub consumable_id: i64,
    pub issue_id: Option<i64>,
    pub event_type: EventType,
    pub holder_id: Option<i64>,
    pub quantity: i64,
    pub quantity_change: i64,
    pub reported_by: i64,
    pub notes: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumableEventRow {
    pub event_type: EventType,
    pub holder: Option<String>,
    pub quantity: i64,
    pub quantity_change: i64,
    pub reported_by: Option<String>,
    pub notes: Option<String>,
    pub occurred_at: String,
}

// =========================================================================
// Registry
// =========================================================================

pub fn create_consumable(
    conn: &Connection,
    input: &CreateConsumableInput,
    room: Option<RoomId>,
) -> Result<ConsumableRow, CustodyError> {
    if input.name.trim().is_empty() {
        return Err(CustodyError::invalid("name", "must not be blank"));
    }
    if input.quantity < 0 {
        return Err(CustodyError::invalid("quantity", "must not be negative"));
    }
    if input.low_stock_threshold < 0 {
        return Err(CustodyError::invalid("low_stock_threshold", "must not be negative"));
    }
    let public_id = public_id_or_new(input.public_id.clone())?;
    let ts = now();

    conn.execute(
        "INSERT INTO consumables
            (public_id, name, unit, quantity, low_stock_threshold, room_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            public_id,
            input.name,
            input.unit,
            input.quantity,
            input.low_stock_threshold,
            room.map(|r| r.0),
            ts,
            ts
        ],
    )
    .map_err(|e| unique_violation(e, "public_id", "consumable already exists"))?;

    debug!(consumable = %public_id, quantity = input.quantity, "Registered consumable");
    get_consumable(conn, &public_id)?
        .ok_or_else(|| CustodyError::Internal("consumable vanished after insert".into()))
}

pub fn get_consumable(conn: &Connection, public_id: &str) -> Result<Option<ConsumableRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM consumables WHERE public_id = ?",
            params![public_id],
            ConsumableRow::from_row,
        )
        .optional()?)
}

pub fn get_consumable_by_id(conn: &Connection, id: i64) -> Result<Option<ConsumableRow>, CustodyError> {
    Ok(conn
        .query_row("SELECT * FROM consumables WHERE id = ?", params![id], ConsumableRow::from_row)
        .optional()?)
}

/// Re-read the consumable row inside a write transaction
pub fn lock_consumable(tx: &Connection, id: i64) -> Result<ConsumableRow, CustodyError> {
    get_consumable_by_id(tx, id)?.ok_or_else(|| CustodyError::not_found(format!("consumable #{}", id)))
}

pub fn set_quantity(tx: &Connection, id: i64, quantity: i64) -> Result<(), CustodyError> {
    tx.execute(
        "UPDATE consumables SET quantity = ?, updated_at = ? WHERE id = ?",
        params![quantity, now(), id],
    )?;
    Ok(())
}

pub fn list_consumables(conn: &Connection, filter: &ScopeFilter) -> Result<Vec<ConsumableListing>, CustodyError> {
    let (condition, scope_params) = filter.to_sql(EntityKind::Consumable);
    let sql = format!(
        "SELECT consumables.*, rooms.public_id AS room_public_id
         FROM consumables
         LEFT JOIN rooms ON rooms.id = consumables.room_id
         WHERE {}
         ORDER BY consumables.id",
        condition
    );
    let params: Vec<Box<dyn ToSql>> = scope_params
        .into_iter()
        .map(|p| Box::new(p) as Box<dyn ToSql>)
        .collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(param_refs(&params).as_slice(), |row| {
            let consumable = ConsumableRow::from_row(row)?;
            Ok(ConsumableListing {
                is_low_stock: consumable.is_low_stock(),
                room: row.get("room_public_id")?,
                consumable,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// =========================================================================
// Issuance ledger
// =========================================================================

pub fn open_issue_for(
    conn: &Connection,
    consumable_id: i64,
    holder_id: i64,
) -> Result<Option<ConsumableIssueRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM consumable_issues
             WHERE consumable_id = ? AND holder_id = ? AND state = 'open'",
            params![consumable_id, holder_id],
            ConsumableIssueRow::from_row,
        )
        .optional()?)
}

pub fn get_issue(conn: &Connection, public_id: &str) -> Result<Option<ConsumableIssueRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM consumable_issues WHERE public_id = ?",
            params![public_id],
            ConsumableIssueRow::from_row,
        )
        .optional()?)
}

/// Re-read an issue inside a write transaction
pub fn lock_issue(tx: &Connection, id: i64) -> Result<ConsumableIssueRow, CustodyError> {
    tx.query_row(
        "SELECT * FROM consumable_issues WHERE id = ?",
        params![id],
        ConsumableIssueRow::from_row,
    )
    .optional()?
    .ok_or_else(|| CustodyError::not_found(format!("consumable issue #{}", id)))
}

pub fn insert_issue(
    tx: &Connection,
    consumable_id: i64,
    holder_id: i64,
    quantity: i64,
    assigned_by: i64,
    purpose: Option<&str>,
) -> Result<ConsumableIssueRow, CustodyError> {
    let public_id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO consumable_issues
            (public_id, consumable_id, holder_id, quantity, issued_quantity, assigned_by, purpose, issued_at, state)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open')",
        params![public_id, consumable_id, holder_id, quantity, quantity, assigned_by, purpose, now()],
    )
    .map_err(|e| unique_violation(e, "holder", "holder already has an open issue"))?;
    lock_issue(tx, tx.last_insert_rowid())
}

/// Merge a further issuance into an open issue
pub fn increase_issue(tx: &Connection, id: i64, quantity: i64) -> Result<ConsumableIssueRow, CustodyError> {
    tx.execute(
        "UPDATE consumable_issues
         SET quantity = quantity + ?1, issued_quantity = issued_quantity + ?1
         WHERE id = ?2 AND state = 'open'",
        params![quantity, id],
    )?;
    lock_issue(tx, id)
}

/// Remove units from the holder's custody, closing the issue at zero
pub fn reduce_issue(tx: &Connection, id: i64, quantity: i64) -> Result<ConsumableIssueRow, CustodyError> {
    tx.execute(
        "UPDATE consumable_issues
         SET quantity = quantity - ?1,
             state = CASE WHEN quantity - ?1 = 0 THEN 'closed' ELSE state END,
             returned_at = CASE WHEN quantity - ?1 = 0 THEN ?2 ELSE returned_at END
         WHERE id = ?3 AND state = 'open'",
        params![quantity, now(), id],
    )?;
    lock_issue(tx, id)
}

pub fn open_issues_for_holder(
    conn: &Connection,
    holder_id: i64,
) -> Result<Vec<(ConsumableRow, ConsumableIssueRow)>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM consumable_issues WHERE holder_id = ? AND state = 'open' ORDER BY id",
    )?;
    let issues = stmt
        .query_map(params![holder_id], ConsumableIssueRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut held = Vec::with_capacity(issues.len());
    for issue in issues {
        held.push((lock_consumable(conn, issue.consumable_id)?, issue));
    }
    Ok(held)
}

pub fn insert_event(tx: &Connection, event: &NewConsumableEvent<'_>) -> Result<i64, CustodyError> {
    tx.execute(
        "INSERT INTO consumable_events
            (consumable_id, issue_id, event_type, holder_id, quantity, quantity_change, reported_by, notes, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.consumable_id,
            event.issue_id,
            event.event_type,
            event.holder_id,
            event.quantity,
            event.quantity_change,
            event.reported_by,
            event.notes,
            now()
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

pub fn list_events(conn: &Connection, consumable_id: i64) -> Result<Vec<ConsumableEventRow>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT e.event_type, h.public_id AS holder, e.quantity, e.quantity_change,
                r.public_id AS reported_by, e.notes, e.occurred_at
         FROM consumable_events e
         LEFT JOIN users h ON h.id = e.holder_id
         LEFT JOIN users r ON r.id = e.reported_by
         WHERE e.consumable_id = ?
         ORDER BY e.id",
    )?;
    let rows = stmt
        .query_map(params![consumable_id], |row| {
            Ok(ConsumableEventRow {
                event_type: row.get("event_type")?,
                holder: row.get("holder")?,
                quantity: row.get("quantity")?,
                quantity_change: row.get("quantity_change")?,
                reported_by: row.get("reported_by")?,
                notes: row.get("notes")?,
                occurred_at: row.get("occurred_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::users::{create_user, CreateUserInput};
    use crate::db::CustodyDb;

    fn input(pid: &str, quantity: i64, threshold: i64) -> CreateConsumableInput {
        CreateConsumableInput {
            public_id: Some(pid.into()),
            name: "Gloves".into(),
            unit: Some("pair".into()),
            quantity,
            low_stock_threshold: threshold,
            room: None,
        }
    }

    fn holder(conn: &Connection, pid: &str) -> i64 {
        create_user(conn, CreateUserInput { public_id: Some(pid.into()), display_name: pid.into(), room: None })
            .unwrap()
            .id
    }

    #[test]
    fn test_merge_increments_both_quantities() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            let c = create_consumable(tx, &input("CON1", 20, 0), None)?;
            let u1 = holder(tx, "u1");
            let issue = insert_issue(tx, c.id, u1, 5, u1, Some("lab"))?;
            let issue = increase_issue(tx, issue.id, 3)?;
            assert_eq!(issue.quantity, 8);
            assert_eq!(issue.issued_quantity, 8);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reduce_closes_at_zero_and_keeps_issued() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            let c = create_consumable(tx, &input("CON1", 20, 0), None)?;
            let u1 = holder(tx, "u1");
            let issue = insert_issue(tx, c.id, u1, 4, u1, None)?;
            let issue = reduce_issue(tx, issue.id, 4)?;
            assert_eq!(issue.quantity, 0);
            assert_eq!(issue.issued_quantity, 4);
            assert_eq!(issue.state, CustodyState::Closed);
            assert!(issue.returned_at.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_storage_rejects_overdrawn_issue() {
        let db = CustodyDb::open_in_memory().unwrap();
        let result = db.with_tx(|tx| {
            let c = create_consumable(tx, &input("CON1", 20, 0), None)?;
            let u1 = holder(tx, "u1");
            let issue = insert_issue(tx, c.id, u1, 2, u1, None)?;
            reduce_issue(tx, issue.id, 3)
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_low_stock_flag() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            create_consumable(conn, &input("CON1", 3, 5), None)?;
            create_consumable(conn, &input("CON2", 30, 5), None)?;
            let listing = list_consumables(conn, &ScopeFilter::Unrestricted)?;
            assert!(listing[0].is_low_stock);
            assert!(!listing[1].is_low_stock);
            assert!(list_consumables(conn, &ScopeFilter::Nothing)?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
