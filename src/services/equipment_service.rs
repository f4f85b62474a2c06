//! Equipment service - exclusive custody of unique items
//!
//! `unassigned ⇄ assigned`, driven by assign, unassign and reassign. Every
//! operation re-reads the equipment row first inside its transaction, then
//! the open assignment, so concurrent attempts on the same item are decided
//! in commit order.

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::auth::{AuthContext, PermissionEvaluator, Role};
use crate::db::equipment::{
    self, CreateEquipmentInput, EquipmentAssignmentRow, EquipmentEventRow, EquipmentListing, EquipmentRow,
    EquipmentStatus, NewEquipmentEvent,
};
use crate::db::scope_tree::TreeView;
use crate::db::users::{self, UserRow};
use crate::db::EventType;
use crate::error::CustodyError;
use rusqlite::Connection;

use super::audit::AuditEntry;
use super::events::CustodyEvent;
use super::{authorize, reload_user, require_user, ServiceDeps};

/// Equipment with its custody state after an operation
#[derive(Debug, Clone, Serialize)]
pub struct EquipmentCustody {
    pub equipment: EquipmentRow,
    pub is_assigned: bool,
    pub holder: Option<String>,
    /// The open period, or the one just closed by an unassign
    pub assignment: Option<EquipmentAssignmentRow>,
}

pub struct EquipmentService {
    deps: ServiceDeps,
}

fn label(equipment: &EquipmentRow) -> String {
    format!("equipment {}", equipment.public_id)
}

fn find(conn: &Connection, public_id: &str) -> Result<EquipmentRow, CustodyError> {
    equipment::get_equipment(conn, public_id)?
        .ok_or_else(|| CustodyError::not_found(format!("equipment {}", public_id)))
}

fn authorize_recipient(conn: &Connection, ctx: &AuthContext, recipient: &UserRow) -> Result<(), CustodyError> {
    authorize(conn, ctx, Role::RoomClerk, recipient.room(), &format!("user {}", recipient.public_id))
}

impl EquipmentService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self { deps }
    }

    /// Both the item and the person receiving it must sit inside the
    /// actor's jurisdiction.
    fn authorize_handover(
        &self,
        conn: &Connection,
        ctx: &AuthContext,
        equipment: &EquipmentRow,
        recipient: &UserRow,
    ) -> Result<(), CustodyError> {
        authorize(conn, ctx, Role::RoomClerk, equipment.room(), &label(equipment))?;
        authorize_recipient(conn, ctx, recipient)
    }

    fn audit(
        &self,
        conn: &Connection,
        ctx: &AuthContext,
        action: &'static str,
        equipment: &EquipmentRow,
        details: serde_json::Value,
    ) -> Result<(), CustodyError> {
        self.deps.record(
            conn,
            ctx,
            AuditEntry {
                action,
                target_kind: "equipment",
                target_public_id: equipment.public_id.clone(),
                target_name: equipment.name.clone(),
                room: equipment.room(),
                details,
            },
        )
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, ctx: &AuthContext, public_id: &str) -> Result<EquipmentCustody, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let row = find(conn, public_id)?;
            authorize(conn, ctx, Role::RoomViewer, row.room(), &label(&row))?;
            let assignment = equipment::open_assignment(conn, row.id)?;
            let holder = match &assignment {
                Some(a) => users::get_user_by_id(conn, a.holder_id)?.map(|u| u.public_id),
                None => None,
            };
            Ok(EquipmentCustody {
                equipment: row,
                is_assigned: assignment.is_some(),
                holder,
                assignment,
            })
        })
    }

    pub fn list(&self, ctx: &AuthContext) -> Result<Vec<EquipmentListing>, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let tree = TreeView(conn);
            let filter = PermissionEvaluator::new(&tree).scope_filter(ctx);
            equipment::list_equipment(conn, &filter)
        })
    }

    pub fn history(&self, ctx: &AuthContext, public_id: &str) -> Result<Vec<EquipmentEventRow>, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let row = find(conn, public_id)?;
            authorize(conn, ctx, Role::RoomViewer, row.room(), &label(&row))?;
            equipment::list_events(conn, row.id)
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Register a new item in a room the actor administers
    pub fn register(&self, ctx: &AuthContext, input: CreateEquipmentInput) -> Result<EquipmentRow, CustodyError> {
        self.deps.db.with_tx(|tx| {
            let room = users::room_of(tx, input.room.as_deref())?;
            authorize(
                tx,
                ctx,
                Role::RoomAdmin,
                room,
                &format!("room {}", input.room.as_deref().unwrap_or("-")),
            )?;
            let row = equipment::create_equipment(
                tx,
                input.public_id.clone(),
                &input.name,
                input.serial_number.as_deref(),
                room,
            )?;
            self.audit(tx, ctx, "equipment.register", &row, json!({ "serial_number": row.serial_number }))?;
            Ok(row)
        })
    }

    /// Open a custody period for `user`. Fails if one is already open.
    pub fn assign(
        &self,
        ctx: &AuthContext,
        equipment_id: &str,
        user: &str,
        notes: Option<&str>,
    ) -> Result<EquipmentCustody, CustodyError> {
        debug!(actor = %ctx.actor().public_id, asset = %equipment_id, holder = %user, "Assigning equipment");

        let (row, holder) = self.deps.db.with_conn(|conn| {
            let row = find(conn, equipment_id)?;
            authorize(conn, ctx, Role::RoomClerk, row.room(), &label(&row))?;
            let holder = require_user(conn, user)?;
            authorize_recipient(conn, ctx, &holder)?;
            Ok((row, holder))
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = equipment::lock_equipment(tx, row.id)?;
            let holder = reload_user(tx, &holder)?;
            self.authorize_handover(tx, ctx, &row, &holder)?;

            if !row.status.is_assignable() {
                return Err(CustodyError::invalid("status", format!("equipment is {}", row.status)));
            }
            if equipment::open_assignment(tx, row.id)?.is_some() {
                return Err(CustodyError::invalid("equipment", "equipment is already assigned"));
            }

            let assignment = equipment::insert_assignment(tx, row.id, holder.id, ctx.actor().id, notes)?;
            equipment::insert_event(
                tx,
                &NewEquipmentEvent {
                    equipment_id: row.id,
                    assignment_id: Some(assignment.id),
                    event_type: EventType::Assigned,
                    holder_id: Some(holder.id),
                    status: None,
                    reported_by: ctx.actor().id,
                    notes,
                },
            )?;
            self.audit(
                tx,
                ctx,
                "equipment.assign",
                &row,
                json!({ "holder": holder.public_id, "assignment": assignment.public_id }),
            )?;

            Ok(EquipmentCustody {
                equipment: row,
                is_assigned: true,
                holder: Some(holder.public_id),
                assignment: Some(assignment),
            })
        })?;

        self.deps.events.emit(CustodyEvent::EquipmentAssigned {
            equipment: custody.equipment.public_id.clone(),
            holder: user.to_string(),
            actor: ctx.actor().public_id.clone(),
        });
        Ok(custody)
    }

    /// Close the open custody period held by `user`
    pub fn unassign(
        &self,
        ctx: &AuthContext,
        equipment_id: &str,
        user: &str,
        notes: Option<&str>,
    ) -> Result<EquipmentCustody, CustodyError> {
        debug!(actor = %ctx.actor().public_id, asset = %equipment_id, holder = %user, "Unassigning equipment");

        let (row, holder) = self.deps.db.with_conn(|conn| {
            let row = find(conn, equipment_id)?;
            authorize(conn, ctx, Role::RoomClerk, row.room(), &label(&row))?;
            let holder = require_user(conn, user)?;
            Ok((row, holder))
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = equipment::lock_equipment(tx, row.id)?;
            authorize(tx, ctx, Role::RoomClerk, row.room(), &label(&row))?;

            let open = equipment::open_assignment(tx, row.id)?
                .ok_or_else(|| CustodyError::invalid("equipment", "equipment is not assigned"))?;
            if open.holder_id != holder.id {
                return Err(CustodyError::invalid("user", "equipment is not held by this user"));
            }

            let closed = equipment::close_assignment(tx, open.id, notes)?;
            equipment::insert_event(
                tx,
                &NewEquipmentEvent {
                    equipment_id: row.id,
                    assignment_id: Some(closed.id),
                    event_type: EventType::Returned,
                    holder_id: Some(holder.id),
                    status: None,
                    reported_by: ctx.actor().id,
                    notes,
                },
            )?;
            self.audit(
                tx,
                ctx,
                "equipment.unassign",
                &row,
                json!({ "holder": holder.public_id, "assignment": closed.public_id }),
            )?;

            Ok(EquipmentCustody {
                equipment: row,
                is_assigned: false,
                holder: None,
                assignment: Some(closed),
            })
        })?;

        self.deps.events.emit(CustodyEvent::EquipmentReturned {
            equipment: custody.equipment.public_id.clone(),
            holder: user.to_string(),
            actor: ctx.actor().public_id.clone(),
        });
        Ok(custody)
    }

    /// Hand the open custody period from `from_user` to `to_user` without
    /// an unassigned gap.
    pub fn reassign(
        &self,
        ctx: &AuthContext,
        equipment_id: &str,
        from_user: &str,
        to_user: &str,
        notes: Option<&str>,
    ) -> Result<EquipmentCustody, CustodyError> {
        debug!(
            actor = %ctx.actor().public_id,
            asset = %equipment_id,
            from = %from_user,
            to = %to_user,
            "Reassigning equipment"
        );
        if from_user == to_user {
            return Err(CustodyError::invalid("to_user", "must differ from the current holder"));
        }

        let (row, from, to) = self.deps.db.with_conn(|conn| {
            let row = find(conn, equipment_id)?;
            authorize(conn, ctx, Role::RoomClerk, row.room(), &label(&row))?;
            let from = require_user(conn, from_user)?;
            let to = require_user(conn, to_user)?;
            authorize_recipient(conn, ctx, &to)?;
            Ok((row, from, to))
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = equipment::lock_equipment(tx, row.id)?;
            let to = reload_user(tx, &to)?;
            self.authorize_handover(tx, ctx, &row, &to)?;

            if !row.status.is_assignable() {
                return Err(CustodyError::invalid("status", format!("equipment is {}", row.status)));
            }
            let open = equipment::open_assignment(tx, row.id)?
                .ok_or_else(|| CustodyError::invalid("equipment", "equipment is not assigned"))?;
            if open.holder_id != from.id {
                return Err(CustodyError::invalid("from_user", "equipment is not held by this user"));
            }

            equipment::insert_event(
                tx,
                &NewEquipmentEvent {
                    equipment_id: row.id,
                    assignment_id: Some(open.id),
                    event_type: EventType::Returned,
                    holder_id: Some(from.id),
                    status: None,
                    reported_by: ctx.actor().id,
                    notes,
                },
            )?;
            let assignment = equipment::transfer_assignment(tx, open.id, to.id, ctx.actor().id, notes)?;
            equipment::insert_event(
                tx,
                &NewEquipmentEvent {
                    equipment_id: row.id,
                    assignment_id: Some(assignment.id),
                    event_type: EventType::Assigned,
                    holder_id: Some(to.id),
                    status: None,
                    reported_by: ctx.actor().id,
                    notes,
                },
            )?;
            self.audit(
                tx,
                ctx,
                "equipment.reassign",
                &row,
                json!({ "from": from.public_id, "to": to.public_id, "assignment": assignment.public_id }),
            )?;

            Ok(EquipmentCustody {
                equipment: row,
                is_assigned: true,
                holder: Some(to.public_id),
                assignment: Some(assignment),
            })
        })?;

        let actor = ctx.actor().public_id.clone();
        self.deps.events.emit_all([
            CustodyEvent::EquipmentReturned {
                equipment: custody.equipment.public_id.clone(),
                holder: from_user.to_string(),
                actor: actor.clone(),
            },
            CustodyEvent::EquipmentAssigned {
                equipment: custody.equipment.public_id.clone(),
                holder: to_user.to_string(),
                actor,
            },
        ]);
        Ok(custody)
    }

    /// Move the item through its lifecycle. `condemned` is final; `retired`
    /// and `condemned` need the item back first.
    pub fn change_status(
        &self,
        ctx: &AuthContext,
        equipment_id: &str,
        status: EquipmentStatus,
        notes: Option<&str>,
    ) -> Result<EquipmentCustody, CustodyError> {
        debug!(actor = %ctx.actor().public_id, asset = %equipment_id, status = %status, "Changing equipment status");

        let row = self.deps.db.with_conn(|conn| {
            let row = find(conn, equipment_id)?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            Ok(row)
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = equipment::lock_equipment(tx, row.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            if row.status.is_terminal() {
                return Err(CustodyError::invalid("status", format!("equipment is {}", row.status)));
            }
            if row.status == status {
                return Err(CustodyError::invalid("status", format!("equipment is already {}", status)));
            }
            let open = equipment::open_assignment(tx, row.id)?;
            if status.requires_unassigned() && open.is_some() {
                return Err(CustodyError::invalid("status", "equipment is still assigned"));
            }

            let previous = row.status;
            equipment::set_status(tx, row.id, status)?;
            equipment::insert_event(
                tx,
                &NewEquipmentEvent {
                    equipment_id: row.id,
                    assignment_id: open.as_ref().map(|a| a.id),
                    event_type: EventType::StatusChanged,
                    holder_id: open.as_ref().map(|a| a.holder_id),
                    status: Some(status),
                    reported_by: ctx.actor().id,
                    notes,
                },
            )?;
            let row = equipment::lock_equipment(tx, row.id)?;
            self.audit(
                tx,
                ctx,
                "equipment.status",
                &row,
                json!({ "from": previous, "to": status }),
            )?;

            let holder = match &open {
                Some(a) => users::get_user_by_id(tx, a.holder_id)?.map(|u| u.public_id),
                None => None,
            };
            Ok(EquipmentCustody {
                equipment: row,
                is_assigned: open.is_some(),
                holder,
                assignment: open,
            })
        })?;

        self.deps.events.emit(CustodyEvent::EquipmentStatusChanged {
            equipment: custody.equipment.public_id.clone(),
            status,
            actor: ctx.actor().public_id.clone(),
        });
        Ok(custody)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{RoleBinding, Scope};
    use crate::db::scope_tree::{create_department, create_location, create_room, CreateNodeInput};
    use crate::db::users::{create_role_assignment, create_user, set_active_assignment, CreateUserInput};
    use crate::db::CustodyDb;
    use crate::services::EventBus;
    use std::sync::Arc;

    fn node(pid: &str, parent: Option<&str>) -> CreateNodeInput {
        CreateNodeInput { public_id: Some(pid.into()), name: pid.into(), parent: parent.map(str::to_string) }
    }

    /// D1 → L1 → {X, Y}; "viewer", "clerk" and "admin" hold ROOM_VIEWER,
    /// ROOM_CLERK and ROOM_ADMIN of X; u1 sits in X, u2 in Y; E101 sits in X.
    fn setup() -> (EquipmentService, Arc<CustodyDb>) {
        let db = Arc::new(CustodyDb::open_in_memory().unwrap());
        db.with_tx(|tx| {
            create_department(tx, node("D1", None))?;
            create_location(tx, node("L1", Some("D1")))?;
            let x = create_room(tx, node("X", Some("L1")))?;
            create_room(tx, node("Y", Some("L1")))?;
            for (pid, room) in [("viewer", "X"), ("clerk", "X"), ("admin", "X"), ("u1", "X"), ("u2", "Y"), ("u3", "X")] {
                create_user(tx, CreateUserInput { public_id: Some(pid.into()), display_name: pid.into(), room: Some(room.into()) })?;
            }
            for (pid, role) in [("viewer", Role::RoomViewer), ("clerk", Role::RoomClerk), ("admin", Role::RoomAdmin)] {
                let user = users::get_user(tx, pid)?.unwrap();
                let ra = create_role_assignment(tx, None, user.id, &RoleBinding::new(role, Scope::Room(x.node()))?, None)?;
                set_active_assignment(tx, user.id, Some(ra.id))?;
            }
            equipment::create_equipment(tx, Some("E101".into()), "Oscilloscope", Some("SN-1"), Some(x.node()))?;
            Ok(())
        })
        .unwrap();
        (EquipmentService::new(ServiceDeps::new(db.clone(), Arc::new(EventBus::new()))), db)
    }

    fn ctx(db: &CustodyDb, user: &str) -> AuthContext {
        db.with_conn(|conn| AuthContext::resolve(conn, user, None)).unwrap()
    }

    #[test]
    fn test_assign_within_room() {
        let (service, db) = setup();
        let custody = service.assign(&ctx(&db, "clerk"), "E101", "u1", Some("bench work")).unwrap();
        assert!(custody.is_assigned);
        assert_eq!(custody.holder.as_deref(), Some("u1"));

        let err = service.assign(&ctx(&db, "clerk"), "E101", "u3", None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "equipment", .. }));
    }

    #[test]
    fn test_assignee_outside_jurisdiction_is_forbidden() {
        let (service, db) = setup();
        let err = service.assign(&ctx(&db, "clerk"), "E101", "u2", None).unwrap_err();
        assert!(matches!(err, CustodyError::Forbidden { .. }));
        assert!(!service.get(&ctx(&db, "clerk"), "E101").unwrap().is_assigned);
    }

    #[test]
    fn test_viewer_rank_is_insufficient() {
        let (service, db) = setup();
        let viewer = ctx(&db, "viewer");
        assert_eq!(viewer.binding().map(|b| b.role()), Some(Role::RoomViewer));
        assert!(service.get(&viewer, "E101").is_ok());

        let err = service.assign(&viewer, "E101", "u1", None).unwrap_err();
        assert!(matches!(err, CustodyError::Forbidden { required: Role::RoomClerk, .. }));
    }

    #[test]
    fn test_unranked_caller_cannot_discover_users() {
        let (service, db) = setup();
        let u1 = ctx(&db, "u1");
        let err = service.assign(&u1, "E101", "ghost", None).unwrap_err();
        assert!(matches!(err, CustodyError::Forbidden { .. }));
        let err = service.reassign(&u1, "E101", "ghost", "phantom", None).unwrap_err();
        assert!(matches!(err, CustodyError::Forbidden { .. }));

        let err = service.assign(&ctx(&db, "clerk"), "E101", "ghost", None).unwrap_err();
        assert!(matches!(err, CustodyError::NotFound(_)));
    }

    #[test]
    fn test_unassign_checks_holder_and_is_not_idempotent() {
        let (service, db) = setup();
        let clerk = ctx(&db, "clerk");
        service.assign(&clerk, "E101", "u1", None).unwrap();

        let err = service.unassign(&clerk, "E101", "u3", None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "user", .. }));

        let custody = service.unassign(&clerk, "E101", "u1", Some("returned")).unwrap();
        assert!(!custody.is_assigned);
        assert!(custody.assignment.unwrap().returned_at.is_some());

        let err = service.unassign(&clerk, "E101", "u1", None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { .. }));
    }

    #[test]
    fn test_reassign_keeps_single_row_and_logs_both_sides() {
        let (service, db) = setup();
        let clerk = ctx(&db, "clerk");
        let first = service.assign(&clerk, "E101", "u1", None).unwrap();
        let moved = service.reassign(&clerk, "E101", "u1", "u3", None).unwrap();
        assert_eq!(moved.holder.as_deref(), Some("u3"));
        assert_eq!(first.assignment.unwrap().public_id, moved.assignment.unwrap().public_id);

        let events: Vec<EventType> = service
            .history(&clerk, "E101")
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec![EventType::Assigned, EventType::Returned, EventType::Assigned]);

        let err = service.reassign(&clerk, "E101", "u3", "u3", None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "to_user", .. }));
        let err = service.reassign(&clerk, "E101", "u1", "u3", None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "from_user", .. }));
    }

    #[test]
    fn test_status_rules() {
        let (service, db) = setup();
        let clerk = ctx(&db, "clerk");
        let admin = ctx(&db, "admin");

        assert!(matches!(
            service.change_status(&clerk, "E101", EquipmentStatus::Damaged, None),
            Err(CustodyError::Forbidden { required: Role::RoomAdmin, .. })
        ));

        service.assign(&clerk, "E101", "u1", None).unwrap();
        let err = service.change_status(&admin, "E101", EquipmentStatus::Retired, None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "status", .. }));

        service.change_status(&admin, "E101", EquipmentStatus::Damaged, Some("cracked screen")).unwrap();
        service.unassign(&clerk, "E101", "u1", None).unwrap();
        let custody = service.change_status(&admin, "E101", EquipmentStatus::Condemned, None).unwrap();
        assert_eq!(custody.equipment.status, EquipmentStatus::Condemned);

        assert!(service.change_status(&admin, "E101", EquipmentStatus::Ok, None).is_err());
        let err = service.assign(&clerk, "E101", "u1", None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "status", .. }));
    }

    #[test]
    fn test_list_is_scoped() {
        let (service, db) = setup();
        assert_eq!(service.list(&ctx(&db, "clerk")).unwrap().len(), 1);
        assert!(service.list(&ctx(&db, "u1")).unwrap().is_empty());
    }
}
