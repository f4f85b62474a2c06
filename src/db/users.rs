//! Users and their role assignments

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::scope_tree::{self, ScopeLocator};
use super::{now, public_id_or_new, unique_violation};
use crate::auth::{DepartmentId, LocationId, Role, RoleBinding, RoomId, Scope, ScopeChain};
use crate::error::CustodyError;

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let name = value.as_str()?;
        Role::parse(name).ok_or_else(|| FromSqlError::Other(format!("unknown role: {}", name).into()))
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// User row from database
#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub display_name: String,
    #[serde(skip)]
    pub room_id: Option<i64>,
    #[serde(skip)]
    pub active_assignment_id: Option<i64>,
    pub created_at: String,
}

impl UserRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            display_name: row.get("display_name")?,
            room_id: row.get("room_id")?,
            active_assignment_id: row.get("active_assignment_id")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn room(&self) -> Option<RoomId> {
        self.room_id.map(RoomId)
    }
}

/// Input for creating a user
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserInput {
    #[serde(default)]
    pub public_id: Option<String>,
    pub display_name: String,
    /// Public id of the user's current room
    #[serde(default)]
    pub room: Option<String>,
}

/// Role assignment row. The stored scope columns are folded into a
/// [`RoleBinding`]; a nulled column yields a detached binding.
#[derive(Debug, Clone, Serialize)]
pub struct RoleAssignmentRow {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    #[serde(skip)]
    pub user_id: i64,
    pub binding: RoleBinding,
    #[serde(skip)]
    pub granted_by: Option<i64>,
    pub created_at: String,
}

impl RoleAssignmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let role: Role = row.get("role")?;
        let department: Option<i64> = row.get("department_id")?;
        let location: Option<i64> = row.get("location_id")?;
        let room: Option<i64> = row.get("room_id")?;

        let scope = match (role, department, location, room) {
            (Role::SiteAdmin, _, _, _) => Some(Scope::Site),
            (_, Some(d), _, _) => Some(Scope::Department(DepartmentId(d))),
            (_, _, Some(l), _) => Some(Scope::Location(LocationId(l))),
            (_, _, _, Some(r)) => Some(Scope::Room(RoomId(r))),
            _ => None,
        };

        Ok(Self {
            id: row.get("id")?,
            public_id: row.get("public_id")?,
            user_id: row.get("user_id")?,
            binding: RoleBinding::from_stored(role, scope),
            granted_by: row.get("granted_by")?,
            created_at: row.get("created_at")?,
        })
    }
}

// =========================================================================
// Users
// =========================================================================

pub fn create_user(conn: &Connection, input: CreateUserInput) -> Result<UserRow, CustodyError> {
    if input.display_name.trim().is_empty() {
        return Err(CustodyError::invalid("display_name", "must not be blank"));
    }
    let room_id = match input.room.as_deref() {
        Some(pid) => Some(
            scope_tree::get_room(conn, pid)?
                .ok_or_else(|| CustodyError::not_found(format!("room {}", pid)))?
                .id,
        ),
        None => None,
    };
    let public_id = public_id_or_new(input.public_id)?;

    conn.execute(
        "INSERT INTO users (public_id, display_name, room_id, created_at) VALUES (?, ?, ?, ?)",
        params![public_id, input.display_name, room_id, now()],
    )
    .map_err(|e| unique_violation(e, "public_id", "user already exists"))?;

    debug!(user = %public_id, "Created user");
    get_user(conn, &public_id)?.ok_or_else(|| CustodyError::Internal("user vanished after insert".into()))
}

pub fn get_user(conn: &Connection, public_id: &str) -> Result<Option<UserRow>, CustodyError> {
    Ok(conn
        .query_row("SELECT * FROM users WHERE public_id = ?", params![public_id], UserRow::from_row)
        .optional()?)
}

pub fn get_user_by_id(conn: &Connection, id: i64) -> Result<Option<UserRow>, CustodyError> {
    Ok(conn
        .query_row("SELECT * FROM users WHERE id = ?", params![id], UserRow::from_row)
        .optional()?)
}

/// Move a user to another room, or clear their room
pub fn set_user_room(conn: &Connection, user_id: i64, room: Option<RoomId>) -> Result<(), CustodyError> {
    let changed = conn.execute(
        "UPDATE users SET room_id = ? WHERE id = ?",
        params![room.map(|r| r.0), user_id],
    )?;
    if changed == 0 {
        return Err(CustodyError::not_found(format!("user #{}", user_id)));
    }
    Ok(())
}

// =========================================================================
// Role assignments
// =========================================================================

/// Columns a binding is stored in: (department_id, location_id, room_id)
fn scope_columns(binding: &RoleBinding) -> Result<(Option<i64>, Option<i64>, Option<i64>), CustodyError> {
    match binding.scope() {
        Scope::Site => Ok((None, None, None)),
        Scope::Department(d) => Ok((Some(d.0), None, None)),
        Scope::Location(l) => Ok((None, Some(l.0), None)),
        Scope::Room(r) => Ok((None, None, Some(r.0))),
        Scope::Detached => Err(CustodyError::invalid("scope", "a scope node is required")),
    }
}

pub fn create_role_assignment(
    conn: &Connection,
    public_id: Option<String>,
    user_id: i64,
    binding: &RoleBinding,
    granted_by: Option<i64>,
) -> Result<RoleAssignmentRow, CustodyError> {
    let (department_id, location_id, room_id) = scope_columns(binding)?;
    let public_id = public_id_or_new(public_id)?;

    conn.execute(
        "INSERT INTO role_assignments
            (public_id, user_id, role, department_id, location_id, room_id, granted_by, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            public_id,
            user_id,
            binding.role(),
            department_id,
            location_id,
            room_id,
            granted_by,
            now()
        ],
    )
    .map_err(|e| unique_violation(e, "role", "user already holds this role at this scope"))?;

    debug!(assignment = %public_id, role = %binding.role(), "Created role assignment");
    get_role_assignment(conn, &public_id)?
        .ok_or_else(|| CustodyError::Internal("role assignment vanished after insert".into()))
}

pub fn get_role_assignment(conn: &Connection, public_id: &str) -> Result<Option<RoleAssignmentRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM role_assignments WHERE public_id = ?",
            params![public_id],
            RoleAssignmentRow::from_row,
        )
        .optional()?)
}

pub fn get_role_assignment_by_id(conn: &Connection, id: i64) -> Result<Option<RoleAssignmentRow>, CustodyError> {
    Ok(conn
        .query_row(
            "SELECT * FROM role_assignments WHERE id = ?",
            params![id],
            RoleAssignmentRow::from_row,
        )
        .optional()?)
}

pub fn list_role_assignments(conn: &Connection, user_id: i64) -> Result<Vec<RoleAssignmentRow>, CustodyError> {
    let mut stmt = conn.prepare("SELECT * FROM role_assignments WHERE user_id = ? ORDER BY id")?;
    let rows = stmt
        .query_map(params![user_id], RoleAssignmentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Point the user's active assignment at `assignment_id`, or clear it
pub fn set_active_assignment(
    conn: &Connection,
    user_id: i64,
    assignment_id: Option<i64>,
) -> Result<(), CustodyError> {
    conn.execute(
        "UPDATE users SET active_assignment_id = ? WHERE id = ?",
        params![assignment_id, user_id],
    )?;
    Ok(())
}

/// Delete an assignment. Active pointers referencing it are nulled by the
/// foreign key.
pub fn delete_role_assignment(conn: &Connection, id: i64) -> Result<bool, CustodyError> {
    let deleted = conn.execute("DELETE FROM role_assignments WHERE id = ?", params![id])?;
    Ok(deleted > 0)
}

/// Users holding an administrator role whose scope contains the chain's room:
/// ROOM_ADMIN on the room, LOCATION_ADMIN on its location, DEPARTMENT_ADMIN on
/// its department.
pub fn administrators_for(conn: &Connection, chain: &ScopeChain) -> Result<Vec<UserRow>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT u.* FROM users u
         JOIN role_assignments ra ON ra.user_id = u.id
         WHERE (ra.role = 'ROOM_ADMIN' AND ra.room_id = ?1)
            OR (ra.role = 'LOCATION_ADMIN' AND ra.location_id = ?2)
            OR (ra.role = 'DEPARTMENT_ADMIN' AND ra.department_id = ?3)
         ORDER BY u.id",
    )?;
    let rows = stmt
        .query_map(
            params![
                chain.room.map(|r| r.0),
                chain.location.map(|l| l.0),
                chain.department.map(|d| d.0)
            ],
            UserRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn site_admins(conn: &Connection) -> Result<Vec<UserRow>, CustodyError> {
    let mut stmt = conn.prepare(
        "SELECT u.* FROM users u
         JOIN role_assignments ra ON ra.user_id = u.id
         WHERE ra.role = 'SITE_ADMIN'
         ORDER BY u.id",
    )?;
    let rows = stmt.query_map([], UserRow::from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Resolve an optional room locator to a room id
pub fn room_of(conn: &Connection, room: Option<&str>) -> Result<Option<RoomId>, CustodyError> {
    match room {
        Some(pid) => match scope_tree::resolve_scope(conn, &ScopeLocator::Room(pid.to_string()))? {
            Scope::Room(r) => Ok(Some(r)),
            _ => Err(CustodyError::not_found(format!("room {}", pid))),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::scope_tree::{create_department, create_location, create_room, CreateNodeInput};
    use crate::db::CustodyDb;

    fn seed(conn: &Connection) -> (DepartmentId, LocationId, RoomId) {
        let d = create_department(
            conn,
            CreateNodeInput { public_id: Some("D1".into()), name: "Eng".into(), parent: None },
        )
        .unwrap();
        let l = create_location(
            conn,
            CreateNodeInput { public_id: Some("L1".into()), name: "North".into(), parent: Some("D1".into()) },
        )
        .unwrap();
        let r = create_room(
            conn,
            CreateNodeInput { public_id: Some("R1".into()), name: "Lab".into(), parent: Some("L1".into()) },
        )
        .unwrap();
        (d.node(), l.node(), r.node())
    }

    fn user(conn: &Connection, pid: &str, room: Option<&str>) -> UserRow {
        create_user(
            conn,
            CreateUserInput {
                public_id: Some(pid.into()),
                display_name: pid.to_uppercase(),
                room: room.map(str::to_string),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_create_user_in_room() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (_, _, room) = seed(conn);
            let u = user(conn, "u1", Some("R1"));
            assert_eq!(u.room(), Some(room));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_assignment_is_invalid() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (_, _, room) = seed(conn);
            let u = user(conn, "u1", None);
            let binding = RoleBinding::new(Role::RoomAdmin, Scope::Room(room))?;
            create_role_assignment(conn, None, u.id, &binding, None)?;
            let err = create_role_assignment(conn, None, u.id, &binding, None).unwrap_err();
            assert!(matches!(err, CustodyError::InvalidRequest { field: "role", .. }));

            create_role_assignment(conn, None, u.id, &RoleBinding::site_admin(), None)?;
            let err = create_role_assignment(conn, None, u.id, &RoleBinding::site_admin(), None).unwrap_err();
            assert!(matches!(err, CustodyError::InvalidRequest { .. }));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_deleted_node_detaches_assignment() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (dept, _, _) = seed(conn);
            let u = user(conn, "u1", None);
            let binding = RoleBinding::new(Role::DepartmentAdmin, Scope::Department(dept))?;
            let ra = create_role_assignment(conn, Some("RA1".into()), u.id, &binding, None)?;
            assert_eq!(ra.binding.scope(), Scope::Department(dept));

            scope_tree::delete_node(conn, &ScopeLocator::Department("D1".into()))?;
            let ra = get_role_assignment(conn, "RA1")?.unwrap();
            assert_eq!(ra.binding.role(), Role::DepartmentAdmin);
            assert_eq!(ra.binding.scope(), Scope::Detached);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_revoking_active_assignment_clears_pointer() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (_, _, room) = seed(conn);
            let u = user(conn, "u1", None);
            let ra = create_role_assignment(
                conn,
                None,
                u.id,
                &RoleBinding::new(Role::RoomClerk, Scope::Room(room))?,
                None,
            )?;
            set_active_assignment(conn, u.id, Some(ra.id))?;
            assert_eq!(get_user(conn, "u1")?.unwrap().active_assignment_id, Some(ra.id));

            assert!(delete_role_assignment(conn, ra.id)?);
            assert_eq!(get_user(conn, "u1")?.unwrap().active_assignment_id, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_administrators_for_chain() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (dept, loc, room) = seed(conn);
            let room_admin = user(conn, "room-admin", None);
            let dept_admin = user(conn, "dept-admin", None);
            let clerk = user(conn, "clerk", None);
            let site = user(conn, "site", None);
            create_role_assignment(conn, None, room_admin.id, &RoleBinding::new(Role::RoomAdmin, Scope::Room(room))?, None)?;
            create_role_assignment(conn, None, dept_admin.id, &RoleBinding::new(Role::DepartmentAdmin, Scope::Department(dept))?, None)?;
            create_role_assignment(conn, None, clerk.id, &RoleBinding::new(Role::RoomClerk, Scope::Room(room))?, None)?;
            create_role_assignment(conn, None, site.id, &RoleBinding::site_admin(), None)?;

            let chain = ScopeChain { room: Some(room), location: Some(loc), department: Some(dept) };
            let admins: Vec<String> = administrators_for(conn, &chain)?
                .into_iter()
                .map(|u| u.public_id)
                .collect();
            assert_eq!(admins, vec!["room-admin".to_string(), "dept-admin".to_string()]);

            let sites: Vec<String> = site_admins(conn)?.into_iter().map(|u| u.public_id).collect();
            assert_eq!(sites, vec!["site".to_string()]);
            Ok(())
        })
        .unwrap();
    }
}
