//! Accessory registry and quantity custody ledger
//!
//! `accessories.quantity` is the total owned. What is available to hand out
//! is derived: total minus the sum of open assignment quantities.

use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{now, param_refs, public_id_or_new, unique_violation, CustodyState, EventType};
use crate::auth::{EntityKind, RoomId, ScopeFilter};
use crate::error::CustodyError;

/// Accessory row from database
#[derive(Debug, Clone, Serialize)]
pub struct AccessoryRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub name: String,
    pub quantity: i64,
    #[serde(skip)]
    pub room_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl AccessoryRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            name: row.get("name")?,
            quantity: row.get("quantity")?,
            room_id: row.get("room_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn room(&self) -> Option<RoomId> {
        self.room_id.map(RoomId)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessoryAssignmentRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    #[serde(skip)]
    pub accessory_id: i64,
    #[serde(skip)]
    pub holder_id: i64,
    pub quantity: i64,
    #[serde(skip)]
    pub assigned_by: Option<i64>,
    pub assigned_at: String,
    pub returned_at: Option<String>,
    pub state: CustodyState,
}

impl AccessoryAssignmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            accessory_id: row.get("accessory_id")?,
            holder_id: row.get("holder_id")?,
            quantity: row.get("quantity")?,
            assigned_by: row.get("assigned_by")?,
            assigned_at: row.get("assigned_at")?,
            returned_at: row.get("returned_at")?,
            state: row.get("state")?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == CustodyState::Open
    }
}

/// Input for registering an accessory
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccessoryInput {
    #[serde(default)]
    pub public_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub room: Option<String>,
}

/// List row with derived availability
#[derive(Debug, Clone, Serialize)]
pub struct AccessoryListing {
    #[serde(flatten)]
    pub accessory: AccessoryRow,
    pub room: Option<String>,
    pub available_quantity: i64,
}

#[derive(Debug, Clone)]
pub struct NewAccessoryEvent<'a> {
    pub accessory_id: i64,
    pub assignment_id: Option<i64>,
    pub event_type: EventType,
    pub holder_id: Option<i64>,
    pub quantity: i64,
    pub quantity_change: i64,
    pub reported_by: i64,
    pub notes: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessoryEventRow {
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

pub fn create_accessory(
    conn: &Connection,
    public_id: Option<String>,
    name: &str,
    quantity: i64,
    room: Option<RoomId>,
) -> Result<AccessoryRow, CustodyError> {
    if name.trim().is_empty() {
        return Err(CustodyError::invalid("name", "must not be blank"));
    }
    if quantity < 0 {
        return Err(CustodyError::invalid("quantity", "must not be negative"));
    }
    let public_id = public_id_or_new(public_id)?;
    let ts = now();

    conn.execute(
        "INSERT INTO accessories (public_id, name, quantity, room_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![public_id, name, quantity, room.map(|r| r.0), ts, ts],
    )
    .map_err(|e| unique_violation(e, "public_id", "accessory already exists"))?;

    debug!(accessory = %public_id, quantity, "Registered accessory");
    get_accessory(conn, &public_id)?
        .ok_or_else(|| CustodyError::Internal("accessory vanished after insert".into()))
}

pub fn get_accessory(conn: &Connection, public_id: &str) -> Result<Option<AccessoryRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM accessories WHERE public_id = ?",
            params![public_id],
            AccessoryRow::from_row,
        )
        .optional()?)
}

pub fn get_accessory_by_id(conn: &Connection, id: i64) -> Result<Option<AccessoryRow>, CustodyError> {
    Ok(conn
        .query_row("SELECT * FROM accessories WHERE id = ?", params![id], AccessoryRow::from_row)
        .optional()?)
}

/// Re-read the accessory row inside a write transaction
pub fn lock_accessory(tx: &Connection, id: i64) -> Result<AccessoryRow, CustodyError> {
    get_accessory_by_id(tx, id)?.ok_or_else(|| CustodyError::not_found(format!("accessory #{}", id)))
}

/// Sum of open assignment quantities
pub fn assigned_quantity(conn: &Connection, accessory_id: i64) -> Result<i64, CustodyError> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(quantity), 0) FROM accessory_assignments
         WHERE accessory_id = ? AND state = 'open'",
        params![accessory_id],
        |row| row.get(0),
    )?)
}

pub fn available_quantity(conn: &Connection, accessory: &AccessoryRow) -> Result<i64, CustodyError> {
    Ok(accessory.quantity - assigned_quantity(conn, accessory.id)?)
}

pub fn set_quantity(tx: &Connection, id: i64, quantity: i64) -> Result<(), CustodyError> {
    tx.execute(
        "UPDATE accessories SET quantity = ?, updated_at = ? WHERE id = ?",
        params![quantity, now(), id],
    )?;
    Ok(())
}

pub fn list_accessories(conn: &Connection, filter: &ScopeFilter) -> Result<Vec<AccessoryListing>, CustodyError> {
    let (condition, scope_params) = filter.to_sql(EntityKind::Accessory);
    let sql = format!(
        "SELECT accessories.*, rooms.public_id AS room_public_id,
                accessories.quantity - COALESCE((
                    SELECT SUM(aa.quantity) FROM accessory_assignments aa
                    WHERE aa.accessory_id = accessories.id AND aa.state = 'open'
                ), 0) AS available_quantity
         FROM accessories
         LEFT JOIN rooms ON rooms.id = accessories.room_id
         WHERE {}
         ORDER BY accessories.id",
        condition
    );
    let params: Vec<Box<dyn ToSql>> = scope_params
        .into_iter()
        .map(|p| Box::new(p) as Box<dyn ToSql>)
        .collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(param_refs(&params).as_slice(), |row| {
            Ok(AccessoryListing {
                accessory: AccessoryRow::from_row(row)?,
                room: row.get("room_public_id")?,
                available_quantity: row.get("available_quantity")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// =========================================================================
// Custody ledger
// =========================================================================

pub fn open_assignment_for(
    conn: &Connection,
    accessory_id: i64,
    holder_id: i64,
) -> Result<Option<AccessoryAssignmentRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM accessory_assignments
             WHERE accessory_id = ? AND holder_id = ? AND state = 'open'",
            params![accessory_id, holder_id],
            AccessoryAssignmentRow::from_row,
        )
        .optional()?)
}

pub fn get_assignment(conn: &Connection, public_id: &str) -> Result<Option<AccessoryAssignmentRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM accessory_assignments WHERE public_id = ?",
            params![public_id],
            AccessoryAssignmentRow::from_row,
        )
        .optional()?)
}

/// Re-read an assignment inside a write transaction
pub fn lock_assignment(tx: &Connection, id: i64) -> Result<AccessoryAssignmentRow, CustodyError> {
    tx.query_row(
        "SELECT * FROM accessory_assignments WHERE id = ?",
        params![id],
        AccessoryAssignmentRow::from_row,
    )
    .optional()?
    .ok_or_else(|| CustodyError::not_found(format!("accessory assignment #{}", id)))
}

pub fn insert_assignment(
    tx: &Connection,
    accessory_id: i64,
    holder_id: i64,
    quantity: i64,
    assigned_by: i64,
) -> Result<AccessoryAssignmentRow, CustodyError> {
    let public_id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO accessory_assignments
            (public_id, accessory_id, holder_id, quantity, assigned_by, assigned_at, state)
         VALUES (?, ?, ?, ?, ?, ?, 'open')",
        params![public_id, accessory_id, holder_id, quantity, assigned_by, now()],
    )
    .map_err(|e| unique_violation(e, "holder", "holder already has an open assignment"))?;
    lock_assignment(tx, tx.last_insert_rowid())
}

/// Add units to an open assignment
pub fn increase_assignment(tx: &Connection, id: i64, quantity: i64) -> Result<AccessoryAssignmentRow, CustodyError> {
    tx.execute(
        "UPDATE accessory_assignments SET quantity = quantity + ? WHERE id = ? AND state = 'open'",
        params![quantity, id],
    )?;
    lock_assignment(tx, id)
}

/// Remove units from an open assignment, closing it when none remain
pub fn reduce_assignment(tx: &Connection, id: i64, quantity: i64) -> Result<AccessoryAssignmentRow, CustodyError> {
    tx.execute(
        "UPDATE accessory_assignments
         SET quantity = quantity - ?1,
             state = CASE WHEN quantity - ?1 = 0 THEN 'closed' ELSE state END,
             returned_at = CASE WHEN quantity - ?1 = 0 THEN ?2 ELSE returned_at END
         WHERE id = ?3 AND state = 'open'",
        params![quantity, now(), id],
    )?;
    lock_assignment(tx, id)
}

/// Open assignments held by a user, with the accessory they draw on
pub fn open_assignments_for_holder(
    conn: &Connection,
    holder_id: i64,
) -> Result<Vec<(AccessoryRow, AccessoryAssignmentRow)>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM accessory_assignments WHERE holder_id = ? AND state = 'open' ORDER BY id",
    )?;
    let assignments = stmt
        .query_map(params![holder_id], AccessoryAssignmentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut held = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        held.push((lock_accessory(conn, assignment.accessory_id)?, assignment));
    }
    Ok(held)
}

pub fn insert_event(tx: &Connection, event: &NewAccessoryEvent<'_>) -> Result<i64, CustodyError> {
    tx.execute(
        "INSERT INTO accessory_events
            (accessory_id, assignment_id, event_type, holder_id, quantity, quantity_change, reported_by, notes, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.accessory_id,
            event.assignment_id,
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

pub fn list_events(conn: &Connection, accessory_id: i64) -> Result<Vec<AccessoryEventRow>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT e.event_type, h.public_id AS holder, e.quantity, e.quantity_change,
                r.public_id AS reported_by, e.notes, e.occurred_at
         FROM accessory_events e
         LEFT JOIN users h ON h.id = e.holder_id
         LEFT JOIN users r ON r.id = e.reported_by
         WHERE e.accessory_id = ?
         ORDER BY e.id",
    )?;
    let rows = stmt
        .query_map(params![accessory_id], |row| {
            Ok(AccessoryEventRow {
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

    fn holder(conn: &Connection, pid: &str) -> i64 {
        create_user(conn, CreateUserInput { public_id: Some(pid.into()), display_name: pid.into(), room: None })
            .unwrap()
            .id
    }

    #[test]
    fn test_available_quantity_tracks_open_assignments() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            let a = create_accessory(tx, Some("AC1".into()), "Cable", 10, None)?;
            let u1 = holder(tx, "u1");
            let u2 = holder(tx, "u2");
            insert_assignment(tx, a.id, u1, 4, u1)?;
            let second = insert_assignment(tx, a.id, u2, 2, u1)?;
            assert_eq!(available_quantity(tx, &a)?, 4);

            reduce_assignment(tx, second.id, 2)?;
            assert_eq!(available_quantity(tx, &a)?, 6);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reduce_to_zero_closes() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            let a = create_accessory(tx, Some("AC1".into()), "Cable", 5, None)?;
            let u1 = holder(tx, "u1");
            let row = insert_assignment(tx, a.id, u1, 3, u1)?;

            let row = reduce_assignment(tx, row.id, 1)?;
            assert_eq!(row.quantity, 2);
            assert!(row.is_open());

            let row = reduce_assignment(tx, row.id, 2)?;
            assert_eq!(row.quantity, 0);
            assert_eq!(row.state, CustodyState::Closed);
            assert!(row.returned_at.is_some());
            assert!(open_assignment_for(tx, a.id, u1)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_storage_rejects_negative_stock() {
        let db = CustodyDb::open_in_memory().unwrap();
        let result = db.with_tx(|tx| {
            let a = create_accessory(tx, Some("AC1".into()), "Cable", 1, None)?;
            set_quantity(tx, a.id, -1)
        });
        assert!(result.is_err());
    }
}
