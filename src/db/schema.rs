//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::CustodyError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Tables that only ever receive INSERTs
pub const APPEND_ONLY_TABLES: [&str; 4] = [
    "equipment_events",
    "accessory_events",
    "consumable_events",
    "audit_log",
];

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), CustodyError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, CustodyError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), CustodyError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), CustodyError> {
    conn.execute_batch(SCOPE_TREE_SCHEMA)
        .map_err(|e| CustodyError::Internal(format!("Failed to create scope tables: {}", e)))?;
    conn.execute_batch(IDENTITY_SCHEMA)
        .map_err(|e| CustodyError::Internal(format!("Failed to create identity tables: {}", e)))?;
    conn.execute_batch(EQUIPMENT_SCHEMA)
        .map_err(|e| CustodyError::Internal(format!("Failed to create equipment tables: {}", e)))?;
    conn.execute_batch(ACCESSORY_SCHEMA)
        .map_err(|e| CustodyError::Internal(format!("Failed to create accessory tables: {}", e)))?;
    conn.execute_batch(CONSUMABLE_SCHEMA)
        .map_err(|e| CustodyError::Internal(format!("Failed to create consumable tables: {}", e)))?;
    conn.execute_batch(AUDIT_SCHEMA)
        .map_err(|e| CustodyError::Internal(format!("Failed to create audit table: {}", e)))?;

    for table in APPEND_ONLY_TABLES {
        conn.execute_batch(&append_only_triggers(table))
            .map_err(|e| CustodyError::Internal(format!("Failed to guard {}: {}", table, e)))?;
    }

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| CustodyError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// UPDATE and DELETE on `table` abort regardless of who issues them
fn append_only_triggers(table: &str) -> String {
    format!(
        r#"
CREATE TRIGGER IF NOT EXISTS {table}_no_update BEFORE UPDATE ON {table}
BEGIN
    SELECT RAISE(ABORT, 'append_only:{table}');
END;
CREATE TRIGGER IF NOT EXISTS {table}_no_delete BEFORE DELETE ON {table}
BEGIN
    SELECT RAISE(ABORT, 'append_only:{table}');
END;
"#
    )
}

const SCOPE_TREE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS departments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    department_id INTEGER REFERENCES departments(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rooms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    location_id INTEGER REFERENCES locations(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS departments_public_id_fixed
BEFORE UPDATE OF public_id ON departments WHEN NEW.public_id IS NOT OLD.public_id
BEGIN
    SELECT RAISE(ABORT, 'immutable:departments.public_id');
END;
CREATE TRIGGER IF NOT EXISTS locations_public_id_fixed
BEFORE UPDATE OF public_id ON locations WHEN NEW.public_id IS NOT OLD.public_id
BEGIN
    SELECT RAISE(ABORT, 'immutable:locations.public_id');
END;
CREATE TRIGGER IF NOT EXISTS rooms_public_id_fixed
BEFORE UPDATE OF public_id ON rooms WHEN NEW.public_id IS NOT OLD.public_id
BEGIN
    SELECT RAISE(ABORT, 'immutable:rooms.public_id');
END;
"#;

const IDENTITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    room_id INTEGER REFERENCES rooms(id) ON DELETE SET NULL,
    active_assignment_id INTEGER REFERENCES role_assignments(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

-- At most one scope column is set. A nulled column (deleted node) leaves the
-- row in place; such a binding evaluates as covering nothing.
CREATE TABLE IF NOT EXISTS role_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN (
        'ROOM_VIEWER', 'ROOM_CLERK', 'ROOM_ADMIN',
        'LOCATION_VIEWER', 'LOCATION_ADMIN',
        'DEPARTMENT_VIEWER', 'DEPARTMENT_ADMIN',
        'SITE_ADMIN'
    )),
    department_id INTEGER REFERENCES departments(id) ON DELETE SET NULL,
    location_id INTEGER REFERENCES locations(id) ON DELETE SET NULL,
    room_id INTEGER REFERENCES rooms(id) ON DELETE SET NULL,
    granted_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    CHECK ((department_id IS NOT NULL) + (location_id IS NOT NULL) + (room_id IS NOT NULL) <= 1),
    CHECK (role <> 'SITE_ADMIN' OR (department_id IS NULL AND location_id IS NULL AND room_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_role_assignments_site_admin
    ON role_assignments(user_id) WHERE role = 'SITE_ADMIN';

CREATE UNIQUE INDEX IF NOT EXISTS idx_role_assignments_scoped
    ON role_assignments(user_id, role, IFNULL(department_id, 0), IFNULL(location_id, 0), IFNULL(room_id, 0))
    WHERE role <> 'SITE_ADMIN'
      AND (department_id IS NOT NULL OR location_id IS NOT NULL OR room_id IS NOT NULL);
"#;

const EQUIPMENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS equipment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    serial_number TEXT,
    status TEXT NOT NULL DEFAULT 'ok' CHECK (status IN (
        'ok', 'damaged', 'under_repair', 'lost', 'retired', 'condemned'
    )),
    room_id INTEGER REFERENCES rooms(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- One row per custody period
CREATE TABLE IF NOT EXISTS equipment_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    equipment_id INTEGER NOT NULL REFERENCES equipment(id),
    holder_id INTEGER NOT NULL REFERENCES users(id),
    assigned_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    assigned_at TEXT NOT NULL,
    returned_at TEXT,
    state TEXT NOT NULL DEFAULT 'open' CHECK (state IN ('open', 'closed')),
    notes TEXT,
    CHECK ((state = 'closed') = (returned_at IS NOT NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_equipment_assignments_open
    ON equipment_assignments(equipment_id) WHERE state = 'open';

CREATE TABLE IF NOT EXISTS equipment_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    equipment_id INTEGER NOT NULL REFERENCES equipment(id),
    assignment_id INTEGER REFERENCES equipment_assignments(id),
    event_type TEXT NOT NULL CHECK (event_type IN ('assigned', 'returned', 'status_changed')),
    holder_id INTEGER REFERENCES users(id),
    quantity_change INTEGER NOT NULL DEFAULT 0,
    status TEXT,
    reported_by INTEGER REFERENCES users(id),
    notes TEXT,
    occurred_at TEXT NOT NULL
);
"#;

const ACCESSORY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accessories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity >= 0),
    room_id INTEGER REFERENCES rooms(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accessory_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    accessory_id INTEGER NOT NULL REFERENCES accessories(id),
    holder_id INTEGER NOT NULL REFERENCES users(id),
    quantity INTEGER NOT NULL CHECK (quantity >= 0),
    assigned_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    assigned_at TEXT NOT NULL,
    returned_at TEXT,
    state TEXT NOT NULL DEFAULT 'open' CHECK (state IN ('open', 'closed')),
    CHECK (state = 'closed' OR quantity >= 1),
    CHECK (state = 'open' OR quantity = 0),
    CHECK ((state = 'closed') = (returned_at IS NOT NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_accessory_assignments_open
    ON accessory_assignments(accessory_id, holder_id) WHERE state = 'open';

CREATE TABLE IF NOT EXISTS accessory_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    accessory_id INTEGER NOT NULL REFERENCES accessories(id),
    assignment_id INTEGER REFERENCES accessory_assignments(id),
    event_type TEXT NOT NULL CHECK (event_type IN ('assigned', 'returned', 'condemned', 'restocked')),
    holder_id INTEGER REFERENCES users(id),
    quantity INTEGER NOT NULL,
    quantity_change INTEGER NOT NULL,
    reported_by INTEGER REFERENCES users(id),
    notes TEXT,
    occurred_at TEXT NOT NULL
);
"#;

const CONSUMABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS consumables (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    unit TEXT,
    quantity INTEGER NOT NULL CHECK (quantity >= 0),
    low_stock_threshold INTEGER NOT NULL DEFAULT 0 CHECK (low_stock_threshold >= 0),
    room_id INTEGER REFERENCES rooms(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consumable_issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    consumable_id INTEGER NOT NULL REFERENCES consumables(id),
    holder_id INTEGER NOT NULL REFERENCES users(id),
    quantity INTEGER NOT NULL,
    issued_quantity INTEGER NOT NULL CHECK (issued_quantity > 0),
    assigned_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    purpose TEXT,
    issued_at TEXT NOT NULL,
    returned_at TEXT,
    state TEXT NOT NULL DEFAULT 'open' CHECK (state IN ('open', 'closed')),
    CHECK (quantity >= 0 AND quantity <= issued_quantity),
    CHECK (state = 'closed' OR quantity >= 1),
    CHECK (state = 'open' OR quantity = 0),
    CHECK ((state = 'closed') = (returned_at IS NOT NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_consumable_issues_open
    ON consumable_issues(consumable_id, holder_id) WHERE state = 'open';

CREATE TABLE IF NOT EXISTS consumable_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumable_id INTEGER NOT NULL REFERENCES consumables(id),
    issue_id INTEGER REFERENCES consumable_issues(id),
    event_type TEXT NOT NULL CHECK (event_type IN (
        'issued', 'used', 'returned', 'lost', 'damaged', 'expired', 'condemned', 'restocked'
    )),
    holder_id INTEGER REFERENCES users(id),
    quantity INTEGER NOT NULL,
    quantity_change INTEGER NOT NULL,
    reported_by INTEGER REFERENCES users(id),
    notes TEXT,
    occurred_at TEXT NOT NULL
);
"#;

/// No foreign keys: rows must outlive the entities they describe
const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    action TEXT NOT NULL,
    actor_public_id TEXT NOT NULL,
    actor_name TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_public_id TEXT NOT NULL,
    target_name TEXT NOT NULL,
    room_name TEXT,
    location_name TEXT,
    department_name TEXT,
    details_json TEXT,
    occurred_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_locations_department ON locations(department_id);
CREATE INDEX IF NOT EXISTS idx_rooms_location ON rooms(location_id);
CREATE INDEX IF NOT EXISTS idx_users_room ON users(room_id);
CREATE INDEX IF NOT EXISTS idx_role_assignments_user ON role_assignments(user_id);

CREATE INDEX IF NOT EXISTS idx_equipment_room ON equipment(room_id);
CREATE INDEX IF NOT EXISTS idx_equipment_assignments_holder ON equipment_assignments(holder_id, state);
CREATE INDEX IF NOT EXISTS idx_equipment_events_equipment ON equipment_events(equipment_id);

CREATE INDEX IF NOT EXISTS idx_accessories_room ON accessories(room_id);
CREATE INDEX IF NOT EXISTS idx_accessory_assignments_holder ON accessory_assignments(holder_id, state);
CREATE INDEX IF NOT EXISTS idx_accessory_events_accessory ON accessory_events(accessory_id);

CREATE INDEX IF NOT EXISTS idx_consumables_room ON consumables(room_id);
CREATE INDEX IF NOT EXISTS idx_consumable_issues_holder ON consumable_issues(holder_id, state);
CREATE INDEX IF NOT EXISTS idx_consumable_events_consumable ON consumable_events(consumable_id);

CREATE INDEX IF NOT EXISTS idx_audit_log_target ON audit_log(target_kind, target_public_id);
CREATE INDEX IF NOT EXISTS idx_audit_log_occurred_at ON audit_log(occurred_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = conn();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_audit_log_rejects_update_and_delete() {
        let conn = conn();
        conn.execute(
            "INSERT INTO audit_log (public_id, action, actor_public_id, actor_name, target_kind,
                target_public_id, target_name, occurred_at)
             VALUES ('a1', 'equipment.assign', 'u1', 'User', 'equipment', 'E1', 'Drill', 'now')",
            [],
        )
        .unwrap();

        let err: CustodyError = conn
            .execute("UPDATE audit_log SET actor_name = 'Someone else'", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, CustodyError::AppendOnlyViolation { ref table } if table == "audit_log"));

        let err: CustodyError = conn.execute("DELETE FROM audit_log", []).unwrap_err().into();
        assert!(matches!(err, CustodyError::AppendOnlyViolation { .. }));
    }

    #[test]
    fn test_event_tables_are_guarded() {
        let conn = conn();
        for table in APPEND_ONLY_TABLES {
            let triggers: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(triggers, 2, "{table} should carry update and delete guards");
        }
    }

    #[test]
    fn test_site_admin_row_cannot_carry_scope() {
        let conn = conn();
        conn.execute(
            "INSERT INTO departments (public_id, name, created_at) VALUES ('D1', 'Ops', 'now')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO users (public_id, display_name, created_at) VALUES ('U1', 'Ada', 'now')",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO role_assignments (public_id, user_id, role, department_id, created_at)
             VALUES ('RA1', 1, 'SITE_ADMIN', 1, 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
