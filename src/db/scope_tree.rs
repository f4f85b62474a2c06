//! Department → Location → Room tree
//!
//! Parent pointers only. Every read goes to the current rows; nothing here
//! caches ancestry.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{now, public_id_or_new, unique_violation};
use crate::auth::{Ancestry, DepartmentId, LocationId, RoomId, Scope, ScopeChain};
use crate::error::CustodyError;

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub name: String,
    pub created_at: String,
}

impl DepartmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            name: row.get("name")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn node(&self) -> DepartmentId {
        DepartmentId(self.id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub name: String,
    #[serde(skip)]
    pub department_id: Option<i64>,
    pub created_at: String,
}

impl LocationRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            name: row.get("name")?,
            department_id: row.get("department_id")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn node(&self) -> LocationId {
        LocationId(self.id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub name: String,
    #[serde(skip)]
    pub location_id: Option<i64>,
    pub created_at: String,
}

impl RoomRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            name: row.get("name")?,
            location_id: row.get("location_id")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn node(&self) -> RoomId {
        RoomId(self.id)
    }
}

/// Input for creating a tree node. `parent` is the public id of the parent
/// node and is ignored for departments.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNodeInput {
    #[serde(default)]
    pub public_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

/// A node addressed by public id, at one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", content = "id", rename_all = "snake_case")]
pub enum ScopeLocator {
    Room(String),
    Location(String),
    Department(String),
}

/// Names of a room and its ancestors at a point in time, for audit snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeNames {
    pub room: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
}

fn require_name(name: &str) -> Result<(), CustodyError> {
    if name.trim().is_empty() {
        return Err(CustodyError::invalid("name", "must not be blank"));
    }
    Ok(())
}

// =========================================================================
// Create
// =========================================================================

pub fn create_department(conn: &Connection, input: CreateNodeInput) -> Result<DepartmentRow, CustodyError> {
    require_name(&input.name)?;
    let public_id = public_id_or_new(input.public_id)?;

    conn.execute(
        "INSERT INTO departments (public_id, name, created_at) VALUES (?, ?, ?)",
        params![public_id, input.name, now()],
    )
    .map_err(|e| unique_violation(e, "public_id", "department already exists"))?;

    debug!(department = %public_id, "Created department");
    get_department(conn, &public_id)?
        .ok_or_else(|| CustodyError::Internal("department vanished after insert".into()))
}

pub fn create_location(conn: &Connection, input: CreateNodeInput) -> Result<LocationRow, CustodyError> {
    require_name(&input.name)?;
    let parent = input
        .parent
        .as_deref()
        .ok_or_else(|| CustodyError::invalid("parent", "a location needs a department"))?;
    let department = get_department(conn, parent)?
        .ok_or_else(|| CustodyError::not_found(format!("department {}", parent)))?;
    let public_id = public_id_or_new(input.public_id)?;

    conn.execute(
        "INSERT INTO locations (public_id, name, department_id, created_at) VALUES (?, ?, ?, ?)",
        params![public_id, input.name, department.id, now()],
    )
    .map_err(|e| unique_violation(e, "public_id", "location already exists"))?;

    debug!(location = %public_id, department = %department.public_id, "Created location");
    get_location(conn, &public_id)?
        .ok_or_else(|| CustodyError::Internal("location vanished after insert".into()))
}

pub fn create_room(conn: &Connection, input: CreateNodeInput) -> Result<RoomRow, CustodyError> {
    require_name(&input.name)?;
    let parent = input
        .parent
        .as_deref()
        .ok_or_else(|| CustodyError::invalid("parent", "a room needs a location"))?;
    let location = get_location(conn, parent)?
        .ok_or_else(|| CustodyError::not_found(format!("location {}", parent)))?;
    let public_id = public_id_or_new(input.public_id)?;

    conn.execute(
        "INSERT INTO rooms (public_id, name, location_id, created_at) VALUES (?, ?, ?, ?)",
        params![public_id, input.name, location.id, now()],
    )
    .map_err(|e| unique_violation(e, "public_id", "room already exists"))?;

    debug!(room = %public_id, location = %location.public_id, "Created room");
    get_room(conn, &public_id)?
        .ok_or_else(|| CustodyError::Internal("room vanished after insert".into()))
}

// =========================================================================
// Read
// =========================================================================

pub fn get_department(conn: &Connection, public_id: &str) -> Result<Option<DepartmentRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM departments WHERE public_id = ?",
            params![public_id],
            DepartmentRow::from_row,
        )
        .optional()?)
}

pub fn get_location(conn: &Connection, public_id: &str) -> Result<Option<LocationRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM locations WHERE public_id = ?",
            params![public_id],
            LocationRow::from_row,
        )
        .optional()?)
}

pub fn get_room(conn: &Connection, public_id: &str) -> Result<Option<RoomRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM rooms WHERE public_id = ?",
            params![public_id],
            RoomRow::from_row,
        )
        .optional()?)
}

pub fn get_room_by_id(conn: &Connection, room: RoomId) -> Result<Option<RoomRow>, CustodyError> {
    Ok(conn
        .query_row("SELECT * FROM rooms WHERE id = ?", params![room.0], RoomRow::from_row)
        .optional()?)
}

/// Resolve a public id to the node it names
pub fn resolve_scope(conn: &Connection, locator: &ScopeLocator) -> Result<Scope, CustodyError> {
    match locator {
        ScopeLocator::Room(pid) => get_room(conn, pid)?
            .map(|r| Scope::Room(r.node()))
            .ok_or_else(|| CustodyError::not_found(format!("room {}", pid))),
        ScopeLocator::Location(pid) => get_location(conn, pid)?
            .map(|l| Scope::Location(l.node()))
            .ok_or_else(|| CustodyError::not_found(format!("location {}", pid))),
        ScopeLocator::Department(pid) => get_department(conn, pid)?
            .map(|d| Scope::Department(d.node()))
            .ok_or_else(|| CustodyError::not_found(format!("department {}", pid))),
    }
}

/// Current room → location → department chain for a locator
pub fn resolve_chain(conn: &Connection, locator: &ScopeLocator) -> Result<ScopeChain, CustodyError> {
    let tree = TreeView(conn);
    match resolve_scope(conn, locator)? {
        Scope::Room(room) => tree.chain_from_room(room),
        Scope::Location(location) => tree.chain_from_location(location),
        Scope::Department(department) => Ok(ScopeChain {
            department: Some(department),
            ..Default::default()
        }),
        Scope::Site | Scope::Detached => Ok(ScopeChain::default()),
    }
}

/// Names along a room's current chain. Missing links stay `None`.
pub fn scope_names(conn: &Connection, room: Option<RoomId>) -> Result<ScopeNames, CustodyError> {
    let Some(room) = room else {
        return Ok(ScopeNames::default());
    };
    let names = conn
        .query_row(
            "SELECT r.name, l.name, d.name FROM rooms r
             LEFT JOIN locations l ON r.location_id = l.id
             LEFT JOIN departments d ON l.department_id = d.id
             WHERE r.id = ?",
            params![room.0],
            |row| {
                Ok(ScopeNames {
                    room: row.get(0)?,
                    location: row.get(1)?,
                    department: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(names.unwrap_or_default())
}

// =========================================================================
// Relocate / delete
// =========================================================================

/// Move a room under another location
pub fn relocate_room(conn: &Connection, room_pid: &str, location_pid: &str) -> Result<RoomRow, CustodyError> {
    let location = get_location(conn, location_pid)?
        .ok_or_else(|| CustodyError::not_found(format!("location {}", location_pid)))?;
    let changed = conn.execute(
        "UPDATE rooms SET location_id = ? WHERE public_id = ?",
        params![location.id, room_pid],
    )?;
    if changed == 0 {
        return Err(CustodyError::not_found(format!("room {}", room_pid)));
    }
    debug!(room = %room_pid, location = %location_pid, "Relocated room");
    get_room(conn, room_pid)?.ok_or_else(|| CustodyError::not_found(format!("room {}", room_pid)))
}

/// Move a location under another department
pub fn relocate_location(
    conn: &Connection,
    location_pid: &str,
    department_pid: &str,
) -> Result<LocationRow, CustodyError> {
    let department = get_department(conn, department_pid)?
        .ok_or_else(|| CustodyError::not_found(format!("department {}", department_pid)))?;
    let changed = conn.execute(
        "UPDATE locations SET department_id = ? WHERE public_id = ?",
        params![department.id, location_pid],
    )?;
    if changed == 0 {
        return Err(CustodyError::not_found(format!("location {}", location_pid)));
    }
    debug!(location = %location_pid, department = %department_pid, "Relocated location");
    get_location(conn, location_pid)?
        .ok_or_else(|| CustodyError::not_found(format!("location {}", location_pid)))
}

/// Delete a node. References to it are nulled by the foreign keys, which
/// leaves bound role assignments detached.
pub fn delete_node(conn: &Connection, locator: &ScopeLocator) -> Result<(), CustodyError> {
    let (table, pid) = match locator {
        ScopeLocator::Room(pid) => ("rooms", pid),
        ScopeLocator::Location(pid) => ("locations", pid),
        ScopeLocator::Department(pid) => ("departments", pid),
    };
    let deleted = conn.execute(&format!("DELETE FROM {} WHERE public_id = ?", table), params![pid])?;
    if deleted == 0 {
        return Err(CustodyError::not_found(format!("{} {}", table, pid)));
    }
    debug!(table, public_id = %pid, "Deleted scope node");
    Ok(())
}

/// Live [`Ancestry`] over a connection or open transaction
pub struct TreeView<'a>(pub &'a Connection);

impl Ancestry for TreeView<'_> {
    fn location_of_room(&self, room: RoomId) -> Result<Option<LocationId>, CustodyError> {
        let parent: Option<Option<i64>> = self
            .0
            .query_row("SELECT location_id FROM rooms WHERE id = ?", params![room.0], |row| row.get(0))
            .optional()?;
        Ok(parent.flatten().map(LocationId))
    }

    fn department_of_location(&self, location: LocationId) -> Result<Option<DepartmentId>, CustodyError> {
        let parent: Option<Option<i64>> = self
            .0
            .query_row(
                "SELECT department_id FROM locations WHERE id = ?",
                params![location.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(parent.flatten().map(DepartmentId))
    }
}
