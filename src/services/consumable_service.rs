//! Consumable service - issuance, use, return and loss
//!
//! Stock leaves the shelf at issue time. After that only `admin_return`
//! and `restock` put units back; use and loss shrink the holder's custody.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::auth::{AuthContext, PermissionEvaluator, Role};
use crate::db::consumables::{
    self, ConsumableEventRow, ConsumableIssueRow, ConsumableListing, ConsumableRow, CreateConsumableInput,
    NewConsumableEvent,
};
use crate::db::scope_tree::TreeView;
use crate::db::users::{self, UserRow};
use crate::db::{add_stock, positive_quantity, EventType};
use crate::error::CustodyError;
use rusqlite::Connection;

use super::audit::AuditEntry;
use super::events::CustodyEvent;
use super::notify::{responsible_administrators, Notification, PendingNotification};
use super::{authorize, reload_user, require_user, ServiceDeps};

/// Reason units left a holder's custody without being used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Lost,
    Damaged,
    Expired,
    Condemned,
}

impl LossKind {
    pub fn event_type(&self) -> EventType {
        match self {
            LossKind::Lost => EventType::Lost,
            LossKind::Damaged => EventType::Damaged,
            LossKind::Expired => EventType::Expired,
            LossKind::Condemned => EventType::Condemned,
        }
    }
}

/// Consumable stock and the issue touched by an operation
#[derive(Debug, Clone, Serialize)]
pub struct ConsumableCustody {
    pub consumable: ConsumableRow,
    pub is_low_stock: bool,
    pub issue: Option<ConsumableIssueRow>,
}

impl ConsumableCustody {
    fn new(consumable: ConsumableRow, issue: Option<ConsumableIssueRow>) -> Self {
        Self {
            is_low_stock: consumable.is_low_stock(),
            consumable,
            issue,
        }
    }
}

pub struct ConsumableService {
    deps: ServiceDeps,
}

fn label(consumable: &ConsumableRow) -> String {
    format!("consumable {}", consumable.public_id)
}

fn find(conn: &Connection, public_id: &str) -> Result<ConsumableRow, CustodyError> {
    consumables::get_consumable(conn, public_id)?
        .ok_or_else(|| CustodyError::not_found(format!("consumable {}", public_id)))
}

/// The caller's own open issue; anything else reads as absent
fn own_open_issue(conn: &Connection, consumable: &ConsumableRow, holder_id: i64) -> Result<ConsumableIssueRow, CustodyError> {
    consumables::open_issue_for(conn, consumable.id, holder_id)?
        .ok_or_else(|| CustodyError::not_found(format!("open issue of consumable {}", consumable.public_id)))
}

impl ConsumableService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self { deps }
    }

    fn audit(
        &self,
        conn: &Connection,
        ctx: &AuthContext,
        action: &'static str,
        consumable: &ConsumableRow,
        details: serde_json::Value,
    ) -> Result<(), CustodyError> {
        self.deps.record(
            conn,
            ctx,
            AuditEntry {
                action,
                target_kind: "consumable",
                target_public_id: consumable.public_id.clone(),
                target_name: consumable.name.clone(),
                room: consumable.room(),
                details,
            },
        )
    }

    fn emit(
        &self,
        consumable: &str,
        event_type: EventType,
        holder: Option<&UserRow>,
        quantity: i64,
        quantity_change: i64,
    ) {
        self.deps.events.emit(CustodyEvent::ConsumableLedger {
            consumable: consumable.to_string(),
            event_type,
            holder: holder.map(|u| u.public_id.clone()),
            quantity,
            quantity_change,
        });
    }

    /// Resolve low-stock recipients inside the transaction, if enabled
    fn low_stock(&self, conn: &Connection, consumable: &ConsumableRow) -> Result<Option<PendingNotification>, CustodyError> {
        if !self.deps.low_stock_notifications || !consumable.is_low_stock() {
            return Ok(None);
        }
        Ok(Some(PendingNotification {
            recipients: responsible_administrators(conn, consumable.room())?,
            notification: Notification::LowStock {
                consumable: consumable.public_id.clone(),
                quantity: consumable.quantity,
                threshold: consumable.low_stock_threshold,
            },
        }))
    }

    fn dispatch(&self, pending: Option<PendingNotification>) {
        if let Some(pending) = pending {
            pending.dispatch(self.deps.notifier.as_ref());
        }
    }

    /// Shared tail of `use_own` and the loss paths: shrink custody, keep stock
    #[allow(clippy::too_many_arguments)]
    fn reduce_custody(
        &self,
        tx: &Connection,
        ctx: &AuthContext,
        action: &'static str,
        consumable: &ConsumableRow,
        issue: &ConsumableIssueRow,
        event_type: EventType,
        quantity: i64,
    ) -> Result<ConsumableIssueRow, CustodyError> {
        if quantity > issue.quantity {
            return Err(CustodyError::invalid(
                "quantity",
                format!("holder has only {}", issue.quantity),
            ));
        }
        let issue = consumables::reduce_issue(tx, issue.id, quantity)?;
        consumables::insert_event(
            tx,
            &NewConsumableEvent {
                consumable_id: consumable.id,
                issue_id: Some(issue.id),
                event_type,
                holder_id: Some(issue.holder_id),
                quantity,
                quantity_change: -quantity,
                reported_by: ctx.actor().id,
                notes: None,
            },
        )?;
        self.audit(
            tx,
            ctx,
            action,
            consumable,
            json!({ "issue": issue.public_id, "event_type": event_type, "quantity": quantity }),
        )?;
        Ok(issue)
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, ctx: &AuthContext, public_id: &str) -> Result<ConsumableCustody, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let row = find(conn, public_id)?;
            authorize(conn, ctx, Role::RoomViewer, row.room(), &label(&row))?;
            Ok(ConsumableCustody::new(row, None))
        })
    }

    pub fn list(&self, ctx: &AuthContext) -> Result<Vec<ConsumableListing>, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let tree = TreeView(conn);
            let filter = PermissionEvaluator::new(&tree).scope_filter(ctx);
            consumables::list_consumables(conn, &filter)
        })
    }

    pub fn history(&self, ctx: &AuthContext, public_id: &str) -> Result<Vec<ConsumableEventRow>, CustodyError> {
        self.deps.db.with_conn(|conn| {
            let row = find(conn, public_id)?;
            authorize(conn, ctx, Role::RoomViewer, row.room(), &label(&row))?;
            consumables::list_events(conn, row.id)
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Register a consumable. Initial stock is recorded as a restock.
    pub fn register(&self, ctx: &AuthContext, input: CreateConsumableInput) -> Result<ConsumableRow, CustodyError> {
        let row = self.deps.db.with_tx(|tx| {
            let room = users::room_of(tx, input.room.as_deref())?;
            authorize(
                tx,
                ctx,
                Role::RoomAdmin,
                room,
                &format!("room {}", input.room.as_deref().unwrap_or("-")),
            )?;
            let row = consumables::create_consumable(tx, &input, room)?;
            if row.quantity > 0 {
                consumables::insert_event(
                    tx,
                    &NewConsumableEvent {
                        consumable_id: row.id,
                        issue_id: None,
                        event_type: EventType::Restocked,
                        holder_id: None,
                        quantity: row.quantity,
                        quantity_change: row.quantity,
                        reported_by: ctx.actor().id,
                        notes: Some("initial stock"),
                    },
                )?;
            }
            self.audit(
                tx,
                ctx,
                "consumable.register",
                &row,
                json!({ "quantity": row.quantity, "low_stock_threshold": row.low_stock_threshold }),
            )?;
            Ok(row)
        })?;

        if row.quantity > 0 {
            self.emit(&row.public_id, EventType::Restocked, None, row.quantity, row.quantity);
        }
        Ok(row)
    }

    /// Issue `quantity` units from stock to `user`, merging into their
    /// open issue.
    pub fn issue(
        &self,
        ctx: &AuthContext,
        consumable_id: &str,
        user: &str,
        quantity: i64,
        purpose: Option<&str>,
    ) -> Result<ConsumableCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, asset = %consumable_id, holder = %user, quantity, "Issuing consumable");

        let (row, holder) = self.deps.db.with_conn(|conn| {
            let row = find(conn, consumable_id)?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            let holder = require_user(conn, user)?;
            Ok((row, holder))
        })?;

        let (custody, pending) = self.deps.db.with_tx(|tx| {
            let row = consumables::lock_consumable(tx, row.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            if quantity > row.quantity {
                return Err(CustodyError::invalid(
                    "quantity",
                    format!("only {} in stock", row.quantity),
                ));
            }

            let issue = match consumables::open_issue_for(tx, row.id, holder.id)? {
                Some(open) => consumables::increase_issue(tx, open.id, quantity)?,
                None => consumables::insert_issue(tx, row.id, holder.id, quantity, ctx.actor().id, purpose)?,
            };
            consumables::set_quantity(tx, row.id, row.quantity - quantity)?;
            consumables::insert_event(
                tx,
                &NewConsumableEvent {
                    consumable_id: row.id,
                    issue_id: Some(issue.id),
                    event_type: EventType::Issued,
                    holder_id: Some(holder.id),
                    quantity,
                    quantity_change: -quantity,
                    reported_by: ctx.actor().id,
                    notes: purpose,
                },
            )?;
            let row = consumables::lock_consumable(tx, row.id)?;
            self.audit(
                tx,
                ctx,
                "consumable.issue",
                &row,
                json!({ "holder": holder.public_id, "quantity": quantity, "issue": issue.public_id }),
            )?;

            let pending = self.low_stock(tx, &row)?;
            Ok((ConsumableCustody::new(row, Some(issue)), pending))
        })?;

        self.emit(&custody.consumable.public_id, EventType::Issued, Some(&holder), quantity, -quantity);
        self.dispatch(pending);
        Ok(custody)
    }

    /// The caller consumes units from their own open issue. Stock is not
    /// touched.
    pub fn use_own(&self, ctx: &AuthContext, consumable_id: &str, quantity: i64) -> Result<ConsumableCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, asset = %consumable_id, quantity, "Using consumable");

        let row = self.deps.db.with_conn(|conn| {
            let row = find(conn, consumable_id)?;
            own_open_issue(conn, &row, ctx.actor().id)?;
            Ok(row)
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = consumables::lock_consumable(tx, row.id)?;
            let issue = own_open_issue(tx, &row, ctx.actor().id)?;
            let issue = self.reduce_custody(tx, ctx, "consumable.use", &row, &issue, EventType::Used, quantity)?;
            Ok(ConsumableCustody::new(row, Some(issue)))
        })?;

        self.deps.events.emit(CustodyEvent::ConsumableLedger {
            consumable: custody.consumable.public_id.clone(),
            event_type: EventType::Used,
            holder: Some(ctx.actor().public_id.clone()),
            quantity,
            quantity_change: -quantity,
        });
        Ok(custody)
    }

    /// Take units back from an issue into stock
    pub fn admin_return(&self, ctx: &AuthContext, issue_id: &str, quantity: i64) -> Result<ConsumableCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, issue = %issue_id, quantity, "Returning consumable");

        let (row, issue) = self.deps.db.with_conn(|conn| {
            let issue = consumables::get_issue(conn, issue_id)?
                .ok_or_else(|| CustodyError::not_found(format!("consumable issue {}", issue_id)))?;
            let row = consumables::get_consumable_by_id(conn, issue.consumable_id)?
                .ok_or_else(|| CustodyError::not_found(format!("consumable #{}", issue.consumable_id)))?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            Ok((row, issue))
        })?;

        let (custody, holder) = self.deps.db.with_tx(|tx| {
            let row = consumables::lock_consumable(tx, row.id)?;
            let issue = consumables::lock_issue(tx, issue.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            if !issue.is_open() {
                return Err(CustodyError::invalid("issue", "issue is already closed"));
            }
            if quantity > issue.quantity {
                return Err(CustodyError::invalid(
                    "quantity",
                    format!("holder has only {}", issue.quantity),
                ));
            }

            let issue = consumables::reduce_issue(tx, issue.id, quantity)?;
            consumables::set_quantity(tx, row.id, add_stock(row.quantity, quantity)?)?;
            consumables::insert_event(
                tx,
                &NewConsumableEvent {
                    consumable_id: row.id,
                    issue_id: Some(issue.id),
                    event_type: EventType::Returned,
                    holder_id: Some(issue.holder_id),
                    quantity,
                    quantity_change: quantity,
                    reported_by: ctx.actor().id,
                    notes: None,
                },
            )?;
            let row = consumables::lock_consumable(tx, row.id)?;
            let holder = users::get_user_by_id(tx, issue.holder_id)?
                .ok_or_else(|| CustodyError::not_found(format!("user #{}", issue.holder_id)))?;
            self.audit(
                tx,
                ctx,
                "consumable.return",
                &row,
                json!({ "holder": holder.public_id, "quantity": quantity, "issue": issue.public_id }),
            )?;
            Ok((ConsumableCustody::new(row, Some(issue)), holder))
        })?;

        self.emit(&custody.consumable.public_id, EventType::Returned, Some(&holder), quantity, quantity);
        Ok(custody)
    }

    /// Record a loss against an explicit open issue
    pub fn report_loss_admin(
        &self,
        ctx: &AuthContext,
        issue_id: &str,
        quantity: i64,
        kind: LossKind,
    ) -> Result<ConsumableCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, issue = %issue_id, quantity, kind = ?kind, "Recording consumable loss");

        let (row, issue) = self.deps.db.with_conn(|conn| {
            let issue = consumables::get_issue(conn, issue_id)?
                .ok_or_else(|| CustodyError::not_found(format!("consumable issue {}", issue_id)))?;
            let row = consumables::get_consumable_by_id(conn, issue.consumable_id)?
                .ok_or_else(|| CustodyError::not_found(format!("consumable #{}", issue.consumable_id)))?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            Ok((row, issue))
        })?;

        let (custody, holder) = self.deps.db.with_tx(|tx| {
            let row = consumables::lock_consumable(tx, row.id)?;
            let issue = consumables::lock_issue(tx, issue.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            if !issue.is_open() {
                return Err(CustodyError::invalid("issue", "issue is already closed"));
            }
            let issue = self.reduce_custody(tx, ctx, "consumable.loss", &row, &issue, kind.event_type(), quantity)?;
            let holder = users::get_user_by_id(tx, issue.holder_id)?
                .ok_or_else(|| CustodyError::not_found(format!("user #{}", issue.holder_id)))?;
            Ok((ConsumableCustody::new(row, Some(issue)), holder))
        })?;

        self.emit(&custody.consumable.public_id, kind.event_type(), Some(&holder), quantity, -quantity);
        Ok(custody)
    }

    /// The caller reports a loss from their own open issue. Administrators
    /// of the caller's room are told after commit.
    pub fn report_loss_self(
        &self,
        ctx: &AuthContext,
        consumable_id: &str,
        quantity: i64,
        kind: LossKind,
    ) -> Result<ConsumableCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, asset = %consumable_id, quantity, kind = ?kind, "Self-reporting consumable loss");

        let (row, holder) = self.deps.db.with_conn(|conn| {
            let row = find(conn, consumable_id)?;
            own_open_issue(conn, &row, ctx.actor().id)?;
            let holder = require_user(conn, &ctx.actor().public_id)?;
            Ok((row, holder))
        })?;

        let (custody, pending, holder) = self.deps.db.with_tx(|tx| {
            let row = consumables::lock_consumable(tx, row.id)?;
            let issue = own_open_issue(tx, &row, ctx.actor().id)?;
            let issue = self.reduce_custody(tx, ctx, "consumable.loss", &row, &issue, kind.event_type(), quantity)?;

            let holder = reload_user(tx, &holder)?;
            let pending = PendingNotification {
                recipients: responsible_administrators(tx, holder.room())?,
                notification: Notification::ConsumableLossReported {
                    consumable: row.public_id.clone(),
                    holder: holder.public_id.clone(),
                    event_type: kind.event_type(),
                    quantity,
                },
            };
            Ok((ConsumableCustody::new(row, Some(issue)), pending, holder))
        })?;

        self.emit(&custody.consumable.public_id, kind.event_type(), Some(&holder), quantity, -quantity);
        pending.dispatch(self.deps.notifier.as_ref());
        Ok(custody)
    }

    pub fn restock(&self, ctx: &AuthContext, consumable_id: &str, quantity: i64) -> Result<ConsumableCustody, CustodyError> {
        let quantity = positive_quantity(quantity)?;
        debug!(actor = %ctx.actor().public_id, asset = %consumable_id, quantity, "Restocking consumable");

        let row = self.deps.db.with_conn(|conn| {
            let row = find(conn, consumable_id)?;
            authorize(conn, ctx, Role::RoomAdmin, row.room(), &label(&row))?;
            Ok(row)
        })?;

        let custody = self.deps.db.with_tx(|tx| {
            let row = consumables::lock_consumable(tx, row.id)?;
            authorize(tx, ctx, Role::RoomAdmin, row.room(), &label(&row))?;

            consumables::set_quantity(tx, row.id, add_stock(row.quantity, quantity)?)?;
            consumables::insert_event(
                tx,
                &NewConsumableEvent {
                    consumable_id: row.id,
                    issue_id: None,
                    event_type: EventType::Restocked,
                    holder_id: None,
                    quantity,
                    quantity_change: quantity,
                    reported_by: ctx.actor().id,
                    notes: None,
                },
            )?;
            let row = consumables::lock_consumable(tx, row.id)?;
            self.audit(tx, ctx, "consumable.restock", &row, json!({ "quantity": quantity }))?;
            Ok(ConsumableCustody::new(row, None))
        })?;

        self.emit(&custody.consumable.public_id, EventType::Restocked, None, quantity, quantity);
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
    use crate::services::notify::{Notifier, Recipient};
    use crate::services::EventBus;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording(Mutex<Vec<(Vec<String>, Notification)>>);

    impl Notifier for Recording {
        fn notify(&self, recipients: &[Recipient], notification: &Notification) -> Result<(), CustodyError> {
            let to = recipients.iter().map(|r| r.public_id.clone()).collect();
            self.0.lock().unwrap().push((to, notification.clone()));
            Ok(())
        }
    }

    fn node(pid: &str, parent: Option<&str>) -> CreateNodeInput {
        CreateNodeInput { public_id: Some(pid.into()), name: pid.into(), parent: parent.map(str::to_string) }
    }

    /// Room X with admin "admin"; u1 and u2 sit in X; CON1 has 20 in stock,
    /// threshold 5
    fn setup() -> (ConsumableService, Arc<CustodyDb>, Arc<Recording>) {
        let db = Arc::new(CustodyDb::open_in_memory().unwrap());
        db.with_tx(|tx| {
            create_department(tx, node("D1", None))?;
            create_location(tx, node("L1", Some("D1")))?;
            let x = create_room(tx, node("X", Some("L1")))?;
            for pid in ["admin", "u1", "u2"] {
                create_user(tx, CreateUserInput { public_id: Some(pid.into()), display_name: pid.into(), room: Some("X".into()) })?;
            }
            let admin = users::get_user(tx, "admin")?.unwrap();
            let ra = create_role_assignment(tx, None, admin.id, &RoleBinding::new(Role::RoomAdmin, Scope::Room(x.node()))?, None)?;
            set_active_assignment(tx, admin.id, Some(ra.id))?;
            consumables::create_consumable(
                tx,
                &CreateConsumableInput {
                    public_id: Some("CON1".into()),
                    name: "Nitrile gloves".into(),
                    unit: Some("pair".into()),
                    quantity: 20,
                    low_stock_threshold: 5,
                    room: None,
                },
                Some(x.node()),
            )?;
            Ok(())
        })
        .unwrap();
        let recording = Arc::new(Recording::default());
        let deps = ServiceDeps::new(db.clone(), Arc::new(EventBus::new())).with_notifier(recording.clone());
        (ConsumableService::new(deps), db, recording)
    }

    fn ctx(db: &CustodyDb, user: &str) -> AuthContext {
        db.with_conn(|conn| AuthContext::resolve(conn, user, None)).unwrap()
    }

    #[test]
    fn test_issue_merges_and_draws_stock() {
        let (service, db, _) = setup();
        let admin = ctx(&db, "admin");
        let first = service.issue(&admin, "CON1", "u1", 5, Some("lab session")).unwrap();
        assert_eq!(first.consumable.quantity, 15);

        let second = service.issue(&admin, "CON1", "u1", 3, None).unwrap();
        assert_eq!(second.consumable.quantity, 12);
        let issue = second.issue.unwrap();
        assert_eq!(issue.public_id, first.issue.unwrap().public_id);
        assert_eq!((issue.quantity, issue.issued_quantity), (8, 8));

        let err = service.issue(&admin, "CON1", "u2", 13, None).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "quantity", .. }));
    }

    #[test]
    fn test_use_leaves_stock_alone() {
        let (service, db, _) = setup();
        service.issue(&ctx(&db, "admin"), "CON1", "u1", 4, None).unwrap();

        let u1 = ctx(&db, "u1");
        let custody = service.use_own(&u1, "CON1", 3).unwrap();
        assert_eq!(custody.consumable.quantity, 16);
        assert_eq!(custody.issue.as_ref().unwrap().quantity, 1);

        let err = service.use_own(&u1, "CON1", 2).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "quantity", .. }));

        let closed = service.use_own(&u1, "CON1", 1).unwrap().issue.unwrap();
        assert!(!closed.is_open());
        assert!(matches!(service.use_own(&u1, "CON1", 1), Err(CustodyError::NotFound(_))));
    }

    #[test]
    fn test_self_service_never_reveals_other_issues() {
        let (service, db, _) = setup();
        service.issue(&ctx(&db, "admin"), "CON1", "u1", 4, None).unwrap();

        let u2 = ctx(&db, "u2");
        assert!(matches!(service.use_own(&u2, "CON1", 1), Err(CustodyError::NotFound(_))));
        assert!(matches!(
            service.report_loss_self(&u2, "CON1", 1, LossKind::Lost),
            Err(CustodyError::NotFound(_))
        ));
    }

    #[test]
    fn test_admin_return_restores_stock() {
        let (service, db, _) = setup();
        let admin = ctx(&db, "admin");
        let issue = service.issue(&admin, "CON1", "u1", 6, None).unwrap().issue.unwrap();

        let custody = service.admin_return(&admin, &issue.public_id, 6).unwrap();
        assert_eq!(custody.consumable.quantity, 20);
        let issue = custody.issue.unwrap();
        assert_eq!((issue.quantity, issue.issued_quantity), (0, 6));
        assert!(issue.returned_at.is_some());

        let err = service.admin_return(&admin, &issue.public_id, 1).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "issue", .. }));
    }

    #[test]
    fn test_self_reported_loss_notifies_room_admins() {
        let (service, db, recording) = setup();
        service.issue(&ctx(&db, "admin"), "CON1", "u1", 4, None).unwrap();

        let custody = service.report_loss_self(&ctx(&db, "u1"), "CON1", 2, LossKind::Damaged).unwrap();
        assert_eq!(custody.consumable.quantity, 16);
        assert_eq!(custody.issue.unwrap().quantity, 2);

        let sent = recording.0.lock().unwrap();
        let (to, notification) = sent.last().unwrap();
        assert_eq!(to, &vec!["admin".to_string()]);
        assert!(matches!(
            notification,
            Notification::ConsumableLossReported { event_type: EventType::Damaged, quantity: 2, .. }
        ));
    }

    #[test]
    fn test_admin_loss_and_low_stock() {
        let (service, db, recording) = setup();
        let admin = ctx(&db, "admin");
        let issue = service.issue(&admin, "CON1", "u1", 16, None).unwrap();
        assert!(issue.is_low_stock);
        assert!(matches!(
            recording.0.lock().unwrap().last(),
            Some((_, Notification::LowStock { quantity: 4, threshold: 5, .. }))
        ));

        let issue = issue.issue.unwrap();
        let custody = service.report_loss_admin(&admin, &issue.public_id, 16, LossKind::Expired).unwrap();
        assert!(!custody.issue.unwrap().is_open());
        assert_eq!(custody.consumable.quantity, 4);

        let ledger = service.history(&admin, "CON1").unwrap();
        let types: Vec<EventType> = ledger.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Issued, EventType::Expired]);
        assert_eq!(ledger[1].quantity_change, -16);
    }

    #[test]
    fn test_restock_requires_admin() {
        let (service, db, _) = setup();
        let err = service.restock(&ctx(&db, "u1"), "CON1", 5).unwrap_err();
        assert!(matches!(err, CustodyError::Forbidden { .. }));
        let custody = service.restock(&ctx(&db, "admin"), "CON1", 5).unwrap();
        assert_eq!(custody.consumable.quantity, 25);
        assert!(!custody.is_low_stock);
    }

    #[test]
    fn test_restock_past_maximum_is_invalid() {
        let (service, db, _) = setup();
        let admin = ctx(&db, "admin");
        let err = service.restock(&admin, "CON1", i64::MAX).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "quantity", .. }));

        // connection still usable afterwards
        assert_eq!(service.get(&admin, "CON1").unwrap().consumable.quantity, 20);
        assert_eq!(service.history(&admin, "CON1").unwrap().len(), 0);
    }

    #[test]
    fn test_loss_from_holder_without_room_notifies_site_admins() {
        let (service, db, recording) = setup();
        service.issue(&ctx(&db, "admin"), "CON1", "u1", 4, None).unwrap();
        db.with_tx(|tx| {
            let root = create_user(tx, CreateUserInput { public_id: Some("root".into()), display_name: "Root".into(), room: None })?;
            create_role_assignment(tx, None, root.id, &RoleBinding::site_admin(), None)?;
            let u1 = users::get_user(tx, "u1")?.unwrap();
            users::set_user_room(tx, u1.id, None)
        })
        .unwrap();

        service.report_loss_self(&ctx(&db, "u1"), "CON1", 1, LossKind::Lost).unwrap();

        let sent = recording.0.lock().unwrap();
        let (to, notification) = sent.last().unwrap();
        assert_eq!(to, &vec!["root".to_string()]);
        assert!(matches!(
            notification,
            Notification::ConsumableLossReported { event_type: EventType::Lost, quantity: 1, .. }
        ));
    }
}
