//! End-to-end custody scenarios against an on-disk database
//!
//! Tree used throughout:
//!
//! ```text
//! D1 ── L1 ── X, Y
//! D2 ── L2 ── Z
//! ```

use asset_custody::auth::{AuthContext, PermissionEvaluator, Role, RoleBinding, Scope, ScopeTarget};
use asset_custody::db::scope_tree::{self, CreateNodeInput, TreeView};
use asset_custody::db::users::{self, CreateUserInput};
use asset_custody::db::{audit, CustodyDb, EventType};
use asset_custody::services::audit::{AuditEntry, AuditSink};
use asset_custody::services::consumable_service::LossKind;
use asset_custody::{CustodyError, EventBus, ServiceDeps, Services};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    db: Arc<CustodyDb>,
    services: Services,
}

fn node(pid: &str, name: &str, parent: Option<&str>) -> CreateNodeInput {
    CreateNodeInput {
        public_id: Some(pid.into()),
        name: name.into(),
        parent: parent.map(str::to_string),
    }
}

fn grant(db: &CustodyDb, user: &str, binding: RoleBinding) {
    db.with_tx(|tx| {
        let row = users::get_user(tx, user)?.unwrap();
        let assignment = users::create_role_assignment(tx, None, row.id, &binding, None)?;
        users::set_active_assignment(tx, row.id, Some(assignment.id))?;
        Ok(())
    })
    .unwrap();
}

/// Users: "root" SITE_ADMIN, "admin-x" ROOM_ADMIN of X, "dept-1"
/// DEPARTMENT_ADMIN of D1; u1 sits in X, u2 in Y
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(CustodyDb::open(&dir.path().join("custody.db"), Duration::from_secs(5)).unwrap());
    let services = Services::new(db.clone());

    let directory = &services.directory;
    directory.create_department(node("D1", "Engineering", None)).unwrap();
    directory.create_department(node("D2", "Chemistry", None)).unwrap();
    directory.create_location(node("L1", "North Wing", Some("D1"))).unwrap();
    directory.create_location(node("L2", "South Wing", Some("D2"))).unwrap();
    let x = directory.create_room(node("X", "Room X", Some("L1"))).unwrap();
    directory.create_room(node("Y", "Room Y", Some("L1"))).unwrap();
    directory.create_room(node("Z", "Room Z", Some("L2"))).unwrap();

    for (pid, room) in [
        ("root", None),
        ("admin-x", Some("X")),
        ("dept-1", None),
        ("u1", Some("X")),
        ("u2", Some("Y")),
    ] {
        directory
            .create_user(CreateUserInput {
                public_id: Some(pid.into()),
                display_name: pid.to_uppercase(),
                room: room.map(str::to_string),
            })
            .unwrap();
    }
    directory.bootstrap_site_admin("root", "ROOT").unwrap();
    grant(&db, "admin-x", RoleBinding::new(Role::RoomAdmin, Scope::Room(x.node())).unwrap());
    let d1 = db.with_conn(|conn| scope_tree::get_department(conn, "D1")).unwrap().unwrap();
    grant(&db, "dept-1", RoleBinding::new(Role::DepartmentAdmin, Scope::Department(d1.node())).unwrap());

    Fixture { _dir: dir, db, services }
}

impl Fixture {
    fn ctx(&self, user: &str) -> AuthContext {
        self.services.context(user, None).unwrap()
    }

    fn register_equipment(&self, pid: &str, room: &str) {
        self.services
            .equipment
            .register(
                &self.ctx("root"),
                asset_custody::db::equipment::CreateEquipmentInput {
                    public_id: Some(pid.into()),
                    name: "Oscilloscope".into(),
                    serial_number: None,
                    room: Some(room.into()),
                },
            )
            .unwrap();
    }
}

#[test]
fn test_scenario_a_assign_within_room() {
    let f = fixture();
    f.register_equipment("E101", "X");

    let custody = f.services.equipment.assign(&f.ctx("admin-x"), "E101", "u1", None).unwrap();
    assert!(custody.is_assigned);
    assert_eq!(custody.holder.as_deref(), Some("u1"));

    let audit_rows = f.db.with_conn(|conn| audit::list_for_target(conn, "equipment", "E101")).unwrap();
    let last = audit_rows.last().unwrap();
    assert_eq!(last.action, "equipment.assign");
    assert_eq!(last.actor_public_id, "admin-x");
    assert_eq!(last.room_name.as_deref(), Some("Room X"));
    assert_eq!(last.department_name.as_deref(), Some("Engineering"));
}

#[test]
fn test_scenario_b_assignee_in_other_room() {
    let f = fixture();
    f.register_equipment("E101", "X");

    let err = f.services.equipment.assign(&f.ctx("admin-x"), "E101", "u2", None).unwrap_err();
    assert!(matches!(err, CustodyError::Forbidden { .. }));
    assert!(!f.services.equipment.get(&f.ctx("admin-x"), "E101").unwrap().is_assigned);
    assert!(f.services.equipment.history(&f.ctx("root"), "E101").unwrap().is_empty());
}

#[test]
fn test_scenario_c_condemn_limited_by_available() {
    let f = fixture();
    let admin = f.ctx("admin-x");
    f.services
        .accessories
        .register(
            &admin,
            asset_custody::db::accessories::CreateAccessoryInput {
                public_id: Some("AC1".into()),
                name: "HDMI cable".into(),
                quantity: 10,
                room: Some("X".into()),
            },
        )
        .unwrap();
    f.services.accessories.assign(&admin, "AC1", "u1", 4).unwrap();

    let err = f.services.accessories.condemn(&admin, "AC1", 7).unwrap_err();
    assert!(matches!(err, CustodyError::InvalidRequest { field: "quantity", .. }));

    let custody = f.services.accessories.condemn(&admin, "AC1", 6).unwrap();
    assert_eq!(custody.accessory.quantity, 4);
    assert_eq!(custody.available_quantity, 0);
}

#[test]
fn test_scenario_d_issue_merges() {
    let f = fixture();
    let admin = f.ctx("admin-x");
    f.services
        .consumables
        .register(
            &admin,
            asset_custody::db::consumables::CreateConsumableInput {
                public_id: Some("CON1".into()),
                name: "Gloves".into(),
                unit: Some("pair".into()),
                quantity: 20,
                low_stock_threshold: 2,
                room: Some("X".into()),
            },
        )
        .unwrap();

    let first = f.services.consumables.issue(&admin, "CON1", "u1", 5, None).unwrap();
    assert_eq!(first.consumable.quantity, 15);
    let issue = first.issue.unwrap();
    assert_eq!((issue.quantity, issue.issued_quantity), (5, 5));

    let second = f.services.consumables.issue(&admin, "CON1", "u1", 3, None).unwrap();
    assert_eq!(second.consumable.quantity, 12);
    let merged = second.issue.unwrap();
    assert_eq!(merged.public_id, issue.public_id);
    assert_eq!((merged.quantity, merged.issued_quantity), (8, 8));

    let ledger = f.services.consumables.history(&admin, "CON1").unwrap();
    let types: Vec<EventType> = ledger.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::Restocked, EventType::Issued, EventType::Issued]);
}

#[test]
fn test_scenario_e_department_scope_follows_current_tree() {
    let f = fixture();
    let ctx = f.ctx("dept-1");
    let in_scope = |conn: &Connection, room: &str| -> Result<bool, CustodyError> {
        let room = scope_tree::get_room(conn, room)?.unwrap();
        let tree = TreeView(conn);
        PermissionEvaluator::new(&tree).check(&ctx, Role::RoomAdmin, &ScopeTarget::room(room.node()))
    };

    assert!(f.db.with_conn(|conn| in_scope(conn, "X")).unwrap());
    assert!(!f.db.with_conn(|conn| in_scope(conn, "Z")).unwrap());

    // L2 moves under D1 after the assignment was made
    f.services.directory.relocate_location("L2", "D1").unwrap();
    assert!(f.db.with_conn(|conn| in_scope(conn, "Z")).unwrap());

    // and L1 moves away
    f.services.directory.relocate_location("L1", "D2").unwrap();
    assert!(!f.db.with_conn(|conn| in_scope(conn, "X")).unwrap());
}

#[test]
fn test_orphaned_assignment_covers_nothing() {
    let f = fixture();
    f.register_equipment("E101", "Y");
    f.services
        .directory
        .delete_node(&scope_tree::ScopeLocator::Room("X".into()))
        .unwrap();

    let admin = f.ctx("admin-x");
    assert!(admin.binding().is_some());
    let err = f.services.equipment.get(&admin, "E101").unwrap_err();
    assert!(matches!(err, CustodyError::Forbidden { .. }));
    assert!(f.services.equipment.list(&admin).unwrap().is_empty());
}

#[test]
fn test_unassign_twice_fails() {
    let f = fixture();
    f.register_equipment("E101", "X");
    let admin = f.ctx("admin-x");
    f.services.equipment.assign(&admin, "E101", "u1", None).unwrap();
    f.services.equipment.unassign(&admin, "E101", "u1", None).unwrap();

    let err = f.services.equipment.unassign(&admin, "E101", "u1", None).unwrap_err();
    assert!(matches!(err, CustodyError::InvalidRequest { .. }));
}

#[test]
fn test_ledgers_and_audit_are_append_only() {
    let f = fixture();
    f.register_equipment("E101", "X");
    f.services.equipment.assign(&f.ctx("admin-x"), "E101", "u1", None).unwrap();

    for sql in [
        "UPDATE audit_log SET action = 'tampered'",
        "DELETE FROM audit_log",
        "UPDATE equipment_events SET notes = 'tampered'",
        "DELETE FROM equipment_events",
    ] {
        let err = f
            .db
            .with_conn(|conn| conn.execute(sql, []).map_err(CustodyError::from))
            .unwrap_err();
        assert!(matches!(err, CustodyError::AppendOnlyViolation { .. }), "{}", sql);
    }
}

struct UnreachableSink;

impl AuditSink for UnreachableSink {
    fn record(&self, _conn: &Connection, _ctx: &AuthContext, _entry: &AuditEntry) -> Result<(), CustodyError> {
        Err(CustodyError::AuditSink("sink unreachable".into()))
    }
}

#[test]
fn test_audit_failure_rolls_back_mutation() {
    let f = fixture();
    f.register_equipment("E101", "X");
    let audit_before = f.db.with_conn(audit::count).unwrap();

    let failing = Services::with_deps(
        ServiceDeps::new(f.db.clone(), Arc::new(EventBus::new())).with_audit_sink(Arc::new(UnreachableSink)),
    );
    let err = failing.equipment.assign(&f.ctx("admin-x"), "E101", "u1", None).unwrap_err();
    assert!(matches!(err, CustodyError::AuditSink(_)));

    assert!(!f.services.equipment.get(&f.ctx("root"), "E101").unwrap().is_assigned);
    assert!(f.services.equipment.history(&f.ctx("root"), "E101").unwrap().is_empty());
    assert_eq!(f.db.with_conn(audit::count).unwrap(), audit_before);
}

#[test]
fn test_self_service_paths_and_my_custody() {
    let f = fixture();
    let admin = f.ctx("admin-x");
    f.services
        .consumables
        .register(
            &admin,
            asset_custody::db::consumables::CreateConsumableInput {
                public_id: Some("CON1".into()),
                name: "Swabs".into(),
                unit: None,
                quantity: 10,
                low_stock_threshold: 0,
                room: Some("X".into()),
            },
        )
        .unwrap();
    f.services.consumables.issue(&admin, "CON1", "u1", 4, Some("calibration")).unwrap();

    let u1 = f.ctx("u1");
    f.services.consumables.use_own(&u1, "CON1", 1).unwrap();
    f.services.consumables.report_loss_self(&u1, "CON1", 1, LossKind::Lost).unwrap();

    let mine = f.services.my_custody(&u1).unwrap();
    assert_eq!(mine.consumables.len(), 1);
    assert_eq!(mine.consumables[0].quantity, 2);
    assert_eq!(mine.consumables[0].issued_quantity, 4);

    let u2 = f.ctx("u2");
    assert!(matches!(f.services.consumables.use_own(&u2, "CON1", 1), Err(CustodyError::NotFound(_))));
    assert!(f.services.my_custody(&u2).unwrap().consumables.is_empty());

    // stock only moves on issue
    assert_eq!(f.services.consumables.get(&admin, "CON1").unwrap().consumable.quantity, 6);
}
