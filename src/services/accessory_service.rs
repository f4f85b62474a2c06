//! Accessory service - quantity custody over fungible items
//!
//! Assignment and return move units between the shelf and a holder without
//! touching the total owned. Only condemn and restock change `quantity`.

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::auth::{AuthContext, PermissionEvaluator, Role};
use crate::db::accessories::{
    self, AccessoryAssignmentRow, AccessoryEventRow, AccessoryListing, AccessoryRow, CreateAccessoryInput,
    NewAccessoryEvent,
};
use crate::db::scope_tree::TreeView;
use crate::db::users::{self, UserRow};
use crate::db::{add_stock, positive_quantity, EventType};
use crate::error::CustodyError;
use rusqlite::Connection;

use super::audit::AuditEntry;
use super::events::CustodyEvent;
use super::{authorize, require_user, ServiceDeps};

/// Accessory stock after an operation
#[derive(Debug, Clone, Serialize)]
pub struct AccessoryCustody {
    pub accessory: AccessoryRow,
    pub available_quantity: i64,
    /// The assignment touched by the operation, if any
    pub assignment: Option<AccessoryAssignmentRow>,
}

pub struct AccessoryService {
    deps: ServiceDeps,
}

fn label(accessory: &AccessoryRow) -> String {
    format!("accessory {}", accessory.public_id)
}

fn find(conn: &Connection, public_id: &str) -> Result<AccessoryRow, CustodyError> {
    accessories::get_accessory(conn, public_id)?
        .ok_or_else(|| CustodyError::not_found(format!("accessory {}", public_id)))
}

impl AccessoryService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self { deps }
    }

    fn audit(
        &self,
        conn: &Connection,
        ctx: &AuthContext,
        action: &'static str,
        accessory: &AccessoryRow,
        details: serde_json::Value,
    ) -> Result<(), CustodyError> {
        self.deps.record(
            conn,
            ctx,
            AuditEntry {
                action,
                target_kind: "accessory",
                target_public_id: accessory.public_id.clone(),
                target_name: accessory.name.clone(),
                room: accessory.room(),
                details,
            },
        )
    }

    fn emit(&self, accessory: &str, event_type: EventType, holder: Option<&UserRow>, quantity: i64, quantity_change: i64) {
        self.deps.events.emit(CustodyEvent::AccessoryLedger {
            accessory: accessory.to_string(),
            event_type,
            holder: holder.map(|u| u.public_id.clone()),
            quantity,
            quantity_change,
        });
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, ctx: &AuthContext, public_id: &str) -> Result<AccessoryCustody, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let row = find(conn, public_id)?;
            authorize(conn, ctx, Role::RoomViewer, row.room(), &label(&row))?;
            Ok(AccessoryCustody {
                available_quantity: accessories::available_quantity(conn, &row)?,
                accessory: row,
                assignment: None,
            })
        })
    }

    pub fn list(&self, ctx: &AuthContext) -> Result<Vec<AccessoryListing>, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let tree = TreeView(conn);
            let filter = PermissionEvaluator::new(&tree).scope_filter(ctx);
            accessories::list_accessories(conn, &filter)
        })
    }

    pub fn history(&self, ctx: &AuthContext, public_id: &str) -> Result<Vec<AccessoryEventRow>, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let row = find(conn, public_id)?;
            authorize(conn, ctx, Role::RoomViewer, row.room(), &label(&row))?;
            accessories::list_events(conn, row.id)
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Register an accessory. Initial stock is recorded as a restock.
    pub fn register(&self, ctx: &AuthContext, input: CreateAccessoryInput) -> Result<AccessoryRow, CustodyError> {
        let row = self.deps.db.with_tx(|tx| {
            let room = users::room_of(tx, input.room.as_deref())?;
            authorize(
                tx,
                ctx,
                Role::RoomAdmin,
                room,
                &format!("room {}", input.room.as_deref().unwrap_or("-")),
            )?;
            let row = accessories::create_accessory(tx, input.public_id.clone(), &input.name, input.quantity, room)?;
            if row.quantity > 0 {
                accessories::insert_event(
                    tx,
                    &NewAccessoryEvent {
                        accessory_id: row.id,
                        assignment_id: None,
                        event_type: EventType::Restocked,
                        holder_id: None,
                        quantity: row.quantity,
                        quantity_change: row.quantity,
                        reported_by: ctx.actor().id,
                        notes: Some("initial stock"),
                    },
                )?;
            }
            self.audit(tx, ctx, "accessory.register", &row, json!({ "quantity": row.quantity }))?;
            Ok(row)
        })?;

        if row.quantity > 0 {
            self.emit(&row.public_id, EventType::Restocked, None, row.quantity, row.quantity);
        }
        Ok(row)
    }

    /// Hand `quantity` units to `user`, merging into their open assignment
    pub fn assign(
        &self,
        ctx: &AuthContext,
        accessory_id: &str,
        user: &str,
        quantity: i64,
    ) -> Result<AccessoryCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, asset = %accessory_id, holder = %user, quantity, "Assigning accessory");

        let (row, holder) = self.deps.db.with_conn(|conn| {
            let row = find(conn, accessory_id)?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            let holder = require_user(conn, user)?;
            Ok((row, holder))
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = accessories::lock_accessory(tx, row.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            let available = accessories::available_quantity(tx, &row)?;
            if quantity > available {
                return Err(CustodyError::invalid(
                    "quantity",
                    format!("only {} available", available),
                ));
            }

            let assignment = match accessories::open_assignment_for(tx, row.id, holder.id)? {
                Some(open) => accessories::increase_assignment(tx, open.id, quantity)?,
                None => accessories::insert_assignment(tx, row.id, holder.id, quantity, ctx.actor().id)?,
            };
            accessories::insert_event(
                tx,
                &NewAccessoryEvent {
                    accessory_id: row.id,
                    assignment_id: Some(assignment.id),
                    event_type: EventType::Assigned,
                    holder_id: Some(holder.id),
                    quantity,
                    quantity_change: 0,
                    reported_by: ctx.actor().id,
                    notes: None,
                },
            )?;
            self.audit(
                tx,
                ctx,
                "accessory.assign",
                &row,
                json!({ "holder": holder.public_id, "quantity": quantity, "assignment": assignment.public_id }),
            )?;

            Ok(AccessoryCustody {
                available_quantity: available - quantity,
                accessory: row,
                assignment: Some(assignment),
            })
        })?;

        self.emit(&custody.accessory.public_id, EventType::Assigned, Some(&holder), quantity, 0);
        Ok(custody)
    }

    /// Take `quantity` units back from an open assignment
    pub fn admin_return(
        &self,
        ctx: &AuthContext,
        assignment_id: &str,
        quantity: i64,
    ) -> Result<AccessoryCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, assignment = %assignment_id, quantity, "Returning accessory");

        let (row, assignment) = self.deps.db.with_conn(|conn| {
            let assignment = accessories::get_assignment(conn, assignment_id)?
                .ok_or_else(|| CustodyError::not_found(format!("accessory assignment {}", assignment_id)))?;
            let row = accessories::get_accessory_by_id(conn, assignment.accessory_id)?
                .ok_or_else(|| CustodyError::not_found(format!("accessory #{}", assignment.accessory_id)))?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            Ok((row, assignment))
        })?;

        let (custody, holder) = self.deps.db.with_tx(|tx| {
            let row = accessories::lock_accessory(tx, row.id)?;
            let assignment = accessories::lock_assignment(tx, assignment.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            if !assignment.is_open() {
                return Err(CustodyError::invalid("assignment", "assignment is already closed"));
            }
            if quantity > assignment.quantity {
                return Err(CustodyError::invalid(
                    "quantity",
                    format!("holder has only {}", assignment.quantity),
                ));
            }

            let assignment = accessories::reduce_assignment(tx, assignment.id, quantity)?;
            accessories::insert_event(
                tx,
                &NewAccessoryEvent {
                    accessory_id: row.id,
                    assignment_id: Some(assignment.id),
                    event_type: EventType::Returned,
                    holder_id: Some(assignment.holder_id),
                    quantity,
                    quantity_change: 0,
                    reported_by: ctx.actor().id,
                    notes: None,
                },
            )?;
            let holder = users::get_user_by_id(tx, assignment.holder_id)?
                .ok_or_else(|| CustodyError::not_found(format!("user #{}", assignment.holder_id)))?;
            self.audit(
                tx,
                ctx,
                "accessory.return",
                &row,
                json!({ "holder": holder.public_id, "quantity": quantity, "assignment": assignment.public_id }),
            )?;

            let custody = AccessoryCustody {
                available_quantity: accessories::available_quantity(tx, &row)?,
                accessory: row,
                assignment: Some(assignment),
            };
            Ok((custody, holder))
        })?;

        self.emit(&custody.accessory.public_id, EventType::Returned, Some(&holder), quantity, 0);
        Ok(custody)
    }

    /// Write off `quantity` units from the shelf. Units in custody cannot
    /// be condemned.
    pub fn condemn(&self, ctx: &AuthContext, accessory_id: &str, quantity: i64) -> Result<AccessoryCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, asset = %accessory_id, quantity, "Condemning accessory");

        let row = self.deps.db.with_conn(|conn| {
            let row = find(conn, accessory_id)?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            Ok(row)
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = accessories::lock_accessory(tx, row.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            let available = accessories::available_quantity(tx, &row)?;
            if quantity > available {
                return Err(CustodyError::invalid(
                    "quantity",
                    format!("only {} available", available),
                ));
            }

            accessories::set_quantity(tx, row.id, row.quantity - quantity)?;
            accessories::insert_event(
                tx,
                &NewAccessoryEvent {
                    accessory_id: row.id,
                    assignment_id: None,
                    event_type: EventType::Condemned,
                    holder_id: None,
                    quantity,
                    quantity_change: -quantity,
                    reported_by: ctx.actor().id,
                    notes: None,
                },
            )?;
            let row = accessories::lock_accessory(tx, row.id)?;
            self.audit(tx, ctx, "accessory.condemn", &row, json!({ "quantity": quantity }))?;

            Ok(AccessoryCustody {
                available_quantity: available - quantity,
                accessory: row,
                assignment: None,
            })
        })?;

        self.emit(&custody.accessory.public_id, EventType::Condemned, None, quantity, -quantity);
        Ok(custody)
    }

    pub fn restock(&self, ctx: &AuthContext, accessory_id: &str, quantity: i64) -> Result<AccessoryCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, asset = %accessory_id, quantity, "Restocking accessory");

        let row = self.deps.db.with_conn(|conn| {
            let row = find(conn, accessory_id)?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            Ok(row)
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = accessories::lock_accessory(tx, row.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            accessories::set_quantity(tx, row.id, add_stock(row.quantity, quantity)?)?;
            accessories::insert_event(
                tx,
                &NewAccessoryEvent {
                    accessory_id: row.id,
                    assignment_id: None,
                    event_type: EventType::Restocked,
                    holder_id: None,
                    quantity,
                    quantity_change: quantity,
                    reported_by: ctx.actor().id,
                    notes: None,
                },
            )?;
            let row = accessories::lock_accessory(tx, row.id)?;
            self.audit(tx, ctx, "accessory.restock", &row, json!({ "quantity": quantity }))?;

            Ok(AccessoryCustody {
                available_quantity: accessories::available_quantity(tx, &row)?,
                accessory: row,
                assignment: None,
            })
        })?;

        self.emit(&custody.accessory.public_id, EventType::Restocked, None, quantity, quantity);
        Ok(custody)
    }
}
