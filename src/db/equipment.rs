//! Equipment registry and its exclusive custody ledger

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{now, param_refs, public_id_or_new, unique_violation, CustodyState, EventType};
use crate::auth::{EntityKind, RoomId, ScopeFilter};
use crate::error::CustodyError;

/// Equipment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentStatus {
    Ok,
    Damaged,
    UnderRepair,
    Lost,
    Retired,
    Condemned,
}

impl EquipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentStatus::Ok => "ok",
            EquipmentStatus::Damaged => "damaged",
            EquipmentStatus::UnderRepair => "under_repair",
            EquipmentStatus::Lost => "lost",
            EquipmentStatus::Retired => "retired",
            EquipmentStatus::Condemned => "condemned",
        }
    }

    pub fn parse(name: &str) -> Option<EquipmentStatus> {
        [
            EquipmentStatus::Ok,
            EquipmentStatus::Damaged,
            EquipmentStatus::UnderRepair,
            EquipmentStatus::Lost,
            EquipmentStatus::Retired,
            EquipmentStatus::Condemned,
        ]
        .into_iter()
        .find(|s| s.as_str() == name)
    }

    /// No transition leaves this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, EquipmentStatus::Condemned)
    }

    pub fn is_assignable(&self) -> bool {
        !matches!(
            self,
            EquipmentStatus::Lost | EquipmentStatus::Retired | EquipmentStatus::Condemned
        )
    }

    /// Statuses that can only be entered with no open custody
    pub fn requires_unassigned(&self) -> bool {
        matches!(self, EquipmentStatus::Retired | EquipmentStatus::Condemned)
    }
}

impl std::fmt::Display for EquipmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromSql for EquipmentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let name = value.as_str()?;
        EquipmentStatus::parse(name)
            .ok_or_else(|| FromSqlError::Other(format!("unknown equipment status: {}", name).into()))
    }
}

impl ToSql for EquipmentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// Equipment row from database
#[derive(Debug, Clone, Serialize)]
pub struct EquipmentRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub name: String,
    pub serial_number: Option<String>,
    pub status: EquipmentStatus,
    #[serde(skip)]
    pub room_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl EquipmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            name: row.get("name")?,
            serial_number: row.get("serial_number")?,
            status: row.get("status")?,
            room_id: row.get("room_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn room(&self) -> Option<RoomId> {
        self.room_id.map(RoomId)
    }
}

/// One custody period of a piece of equipment
#[derive(Debug, Clone, Serialize)]
pub struct EquipmentAssignmentRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    #[serde(skip)]
    pub equipment_id: i64,
    #[serde(skip)]
    pub holder_id: i64,
    #[serde(skip)]
    pub assigned_by: Option<i64>,
    pub assigned_at: String,
    pub returned_at: Option<String>,
    pub state: CustodyState,
    pub notes: Option<String>,
}

impl EquipmentAssignmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            equipment_id: row.get("equipment_id")?,
            holder_id: row.get("holder_id")?,
            assigned_by: row.get("assigned_by")?,
            assigned_at: row.get("assigned_at")?,
            returned_at: row.get("returned_at")?,
            state: row.get("state")?,
            notes: row.get("notes")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EquipmentEventRow {
    #[serde(skip)]
    pub id: i64,
    pub event_type: EventType,
    pub holder: Option<String>,
    pub quantity_change: i64,
    pub status: Option<EquipmentStatus>,
    pub reported_by: Option<String>,
    pub notes: Option<String>,
    pub occurred_at: String,
}

/// Input for registering equipment
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEquipmentInput {
    #[serde(default)]
    pub public_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Public id of the room the equipment sits in
    #[serde(default)]
    pub room: Option<String>,
}

/// List row with derived custody state
#[derive(Debug, Clone, Serialize)]
pub struct EquipmentListing {
    #[serde(flatten)]
    pub equipment: EquipmentRow,
    pub room: Option<String>,
    pub is_assigned: bool,
    pub holder: Option<String>,
}

/// Event to append to `equipment_events`
#[derive(Debug, Clone)]
pub struct NewEquipmentEvent<'a> {
    pub equipment_id: i64,
    pub assignment_id: Option<i64>,
    pub event_type: EventType,
    pub holder_id: Option<i64>,
    pub status: Option<EquipmentStatus>,
    pub reported_by: i64,
    pub notes: Option<&'a str>,
}

// =========================================================================
// Registry
// =========================================================================

pub fn create_equipment(
    conn: &Connection,
    public_id: Option<String>,
    name: &str,
    serial_number: Option<&str>,
    room: Option<RoomId>,
) -> Result<EquipmentRow, CustodyError> {
    if name.trim().is_empty() {
        return Err(CustodyError::invalid("name", "must not be blank"));
    }
    let public_id = public_id_or_new(public_id)?;
    let ts = now();

    conn.execute(
        "INSERT INTO equipment (public_id, name, serial_number, status, room_id, created_at, updated_at)
         VALUES (?, ?, ?, 'ok', ?, ?, ?)",
        params![public_id, name, serial_number, room.map(|r| r.0), ts, ts],
    )
    .map_err(|e| unique_violation(e, "public_id", "equipment already exists"))?;

    debug!(equipment = %public_id, "Registered equipment");
    get_equipment(conn, &public_id)?
        .ok_or_else(|| CustodyError::Internal("equipment vanished after insert".into()))
}

pub fn get_equipment(conn: &Connection, public_id: &str) -> Result<Option<EquipmentRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM equipment WHERE public_id = ?",
            params![public_id],
            EquipmentRow::from_row,
        )
        .optional()?)
}

/// Re-read the equipment row inside a write transaction
pub fn lock_equipment(tx: &Connection, id: i64) -> Result<EquipmentRow, CustodyError> {
    tx.query_row("SELECT * FROM equipment WHERE id = ?", params![id], EquipmentRow::from_row)
        .optional()?
        .ok_or_else(|| CustodyError::not_found(format!("equipment #{}", id)))
}

pub fn set_status(tx: &Connection, id: i64, status: EquipmentStatus) -> Result<(), CustodyError> {
    tx.execute(
        "UPDATE equipment SET status = ?, updated_at = ? WHERE id = ?",
        params![status, now(), id],
    )?;
    Ok(())
}

/// List equipment visible through `filter`
pub fn list_equipment(conn: &Connection, filter: &ScopeFilter) -> Result<Vec<EquipmentListing>, CustodyError> {
    let (condition, scope_params) = filter.to_sql(EntityKind::Equipment);
    let sql = format!(
        "SELECT equipment.*, rooms.public_id AS room_public_id, holder.public_id AS holder_public_id
         FROM equipment
         LEFT JOIN rooms ON rooms.id = equipment.room_id
         LEFT JOIN equipment_assignments ea ON ea.equipment_id = equipment.id AND ea.state = 'open'
         LEFT JOIN users holder ON holder.id = ea.holder_id
         WHERE {}
         ORDER BY equipment.id",
        condition
    );
    let params: Vec<Box<dyn ToSql>> = scope_params
        .into_iter()
        .map(|p| Box::new(p) as Box<dyn ToSql>)
        .collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(param_refs(&params).as_slice(), |row| {
            let holder: Option<String> = row.get("holder_public_id")?;
            Ok(EquipmentListing {
                equipment: EquipmentRow::from_row(row)?,
                room: row.get("room_public_id")?,
                is_assigned: holder.is_some(),
                holder,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// =========================================================================
// Custody ledger
// =========================================================================

/// The open custody period, if any
pub fn open_assignment(conn: &Connection, equipment_id: i64) -> Result<Option<EquipmentAssignmentRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM equipment_assignments WHERE equipment_id = ? AND state = 'open'",
            params![equipment_id],
            EquipmentAssignmentRow::from_row,
        )
        .optional()?)
}

pub fn insert_assignment(
    tx: &Connection,
    equipment_id: i64,
    holder_id: i64,
    assigned_by: i64,
    notes: Option<&str>,
) -> Result<EquipmentAssignmentRow, CustodyError> {
    let public_id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO equipment_assignments
            (public_id, equipment_id, holder_id, assigned_by, assigned_at, state, notes)
         VALUES (?, ?, ?, ?, ?, 'open', ?)",
        params![public_id, equipment_id, holder_id, assigned_by, now(), notes],
    )
    .map_err(|e| unique_violation(e, "equipment", "equipment is already assigned"))?;

    get_assignment_by_id(tx, tx.last_insert_rowid())
}

/// Close an open custody period
pub fn close_assignment(tx: &Connection, assignment_id: i64, notes: Option<&str>) -> Result<EquipmentAssignmentRow, CustodyError> {
    let changed = tx.execute(
        "UPDATE equipment_assignments
         SET state = 'closed', returned_at = ?, notes = COALESCE(?, notes)
         WHERE id = ? AND state = 'open'",
        params![now(), notes, assignment_id],
    )?;
    if changed == 0 {
        return Err(CustodyError::invalid("assignment", "assignment is already closed"));
    }
    get_assignment_by_id(tx, assignment_id)
}

/// Hand an open custody period to a new holder
pub fn transfer_assignment(
    tx: &Connection,
    assignment_id: i64,
    holder_id: i64,
    assigned_by: i64,
    notes: Option<&str>,
) -> Result<EquipmentAssignmentRow, CustodyError> {
    let changed = tx.execute(
        "UPDATE equipment_assignments
         SET holder_id = ?, assigned_by = ?, assigned_at = ?, notes = ?
         WHERE id = ? AND state = 'open'",
        params![holder_id, assigned_by, now(), notes, assignment_id],
    )?;
    if changed == 0 {
        return Err(CustodyError::invalid("assignment", "assignment is already closed"));
    }
    get_assignment_by_id(tx, assignment_id)
}

fn get_assignment_by_id(conn: &Connection, id: i64) -> Result<EquipmentAssignmentRow, CustodyError> {
    conn.query_row(
        "SELECT * FROM equipment_assignments WHERE id = ?",
        params![id],
        EquipmentAssignmentRow::from_row,
    )
    .optional()?
    .ok_or_else(|| CustodyError::not_found(format!("equipment assignment #{}", id)))
}

/// Open custody periods held by a user, with the equipment they cover
pub fn open_assignments_for_holder(
    conn: &Connection,
    holder_id: i64,
) -> Result<Vec<(EquipmentRow, EquipmentAssignmentRow)>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM equipment_assignments WHERE holder_id = ? AND state = 'open' ORDER BY id",
    )?;
    let ids = stmt
        .query_map(params![holder_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut held = Vec::with_capacity(ids.len());
    for id in ids {
        let assignment = get_assignment_by_id(conn, id)?;
        let equipment = lock_equipment(conn, assignment.equipment_id)?;
        held.push((equipment, assignment));
    }
    Ok(held)
}

pub fn insert_event(tx: &Connection, event: &NewEquipmentEvent<'_>) -> Result<i64, CustodyError> {
    tx.execute(
        "INSERT INTO equipment_events
            (equipment_id, assignment_id, event_type, holder_id, quantity_change, status, reported_by, notes, occurred_at)
         VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?)",
        params![
            event.equipment_id,
            event.assignment_id,
            event.event_type,
            event.holder_id,
            event.status,
            event.reported_by,
            event.notes,
            now()
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Ledger for one piece of equipment, oldest first
pub fn list_events(conn: &Connection, equipment_id: i64) -> Result<Vec<EquipmentEventRow>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.event_type, h.public_id AS holder, e.quantity_change, e.status,
                r.public_id AS reported_by, e.notes, e.occurred_at
         FROM equipment_events e
         LEFT JOIN users h ON h.id = e.holder_id
         LEFT JOIN users r ON r.id = e.reported_by
         WHERE e.equipment_id = ?
         ORDER BY e.id",
    )?;
    let rows = stmt
        .query_map(params![equipment_id], |row| {
            Ok(EquipmentEventRow {
                id: row.get("id")?,
                event_type: row.get("event_type")?,
                holder: row.get("holder")?,
                quantity_change: row.get("quantity_change")?,
                status: row.get("status")?,
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
    fn test_status_round_trip_and_rules() {
        for name in ["ok", "damaged", "under_repair", "lost", "retired", "condemned"] {
            assert_eq!(EquipmentStatus::parse(name).unwrap().as_str(), name);
        }
        assert!(EquipmentStatus::Condemned.is_terminal());
        assert!(!EquipmentStatus::Lost.is_assignable());
        assert!(EquipmentStatus::UnderRepair.is_assignable());
        assert!(EquipmentStatus::Retired.requires_unassigned());
    }

    #[test]
    fn test_second_open_assignment_is_rejected_by_storage() {
        let db = CustodyDb::open_in_memory().unwrap();
        let err = db
            .with_tx(|tx| {
                let e = create_equipment(tx, Some("E1".into()), "Drill", None, None)?;
                let u1 = holder(tx, "u1");
                let u2 = holder(tx, "u2");
                insert_assignment(tx, e.id, u1, u1, None)?;
                insert_assignment(tx, e.id, u2, u1, None)
            })
            .unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "equipment", .. }));
    }

    #[test]
    fn test_close_twice_fails() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            let e = create_equipment(tx, Some("E1".into()), "Drill", None, None)?;
            let u1 = holder(tx, "u1");
            let a = insert_assignment(tx, e.id, u1, u1, Some("first"))?;
            let closed = close_assignment(tx, a.id, None)?;
            assert_eq!(closed.state, CustodyState::Closed);
            assert!(closed.returned_at.is_some());
            assert_eq!(closed.notes.as_deref(), Some("first"));
            assert!(close_assignment(tx, a.id, None).is_err());
            assert!(open_assignment(tx, e.id)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_events_are_append_only() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            let e = create_equipment(tx, Some("E1".into()), "Drill", None, None)?;
            let u1 = holder(tx, "u1");
            insert_event(
                tx,
                &NewEquipmentEvent {
                    equipment_id: e.id,
                    assignment_id: None,
                    event_type: EventType::StatusChanged,
                    holder_id: None,
                    status: Some(EquipmentStatus::Damaged),
                    reported_by: u1,
                    notes: None,
                },
            )?;
            let err: CustodyError = tx.execute("DELETE FROM equipment_events", []).unwrap_err().into();
            assert!(matches!(err, CustodyError::AppendOnlyViolation { .. }));
            assert_eq!(list_events(tx, e.id)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }
}
