//! Service layer for asset-custody
//!
//! Services encapsulate business logic between HTTP handlers and repositories.
//! Each custody operation follows the same shape:
//! - Authorization against the request's [`AuthContext`] (cheap rejection)
//! - One immediate transaction: re-read the asset row, then the ledger row,
//!   re-check authorization and business rules, mutate, append the ledger
//!   event and the audit record
//! - After commit: event bus emission and notification delivery
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (authorization, custody rules)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod response;
pub mod events;
pub mod audit;
pub mod notify;
pub mod directory_service;
pub mod role_service;
pub mod equipment_service;
pub mod accessory_service;
pub mod consumable_service;

// Re-exports
pub use response::*;
pub use events::{CustodyEvent, EventBus, EventListener};
pub use audit::{AuditEntry, AuditSink, SqliteAuditSink};
pub use notify::{Notification, Notifier, Recipient, TracingNotifier};
pub use directory_service::DirectoryService;
pub use role_service::RoleService;
pub use equipment_service::EquipmentService;
pub use accessory_service::AccessoryService;
pub use consumable_service::ConsumableService;

use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;

use crate::auth::{AuthContext, PermissionEvaluator, Role, RoomId, ScopeTarget};
use crate::db::scope_tree::TreeView;
use crate::db::users::{self, UserRow};
use crate::db::{accessories, consumables, equipment, CustodyDb};
use crate::error::CustodyError;

/// Collaborators shared by every service
#[derive(Clone)]
pub struct ServiceDeps {
    pub db: Arc<CustodyDb>,
    pub events: Arc<EventBus>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    pub low_stock_notifications: bool,
}

impl ServiceDeps {
    /// Default sinks: audit rows in the same database, notifications to the log
    pub fn new(db: Arc<CustodyDb>, events: Arc<EventBus>) -> Self {
        Self {
            db,
            events,
            audit: Arc::new(SqliteAuditSink),
            notifier: Arc::new(TracingNotifier),
            low_stock_notifications: true,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_low_stock_notifications(mut self, enabled: bool) -> Self {
        self.low_stock_notifications = enabled;
        self
    }

    pub(crate) fn record(&self, conn: &Connection, ctx: &AuthContext, entry: AuditEntry) -> Result<(), CustodyError> {
        self.audit.record(conn, ctx, &entry)
    }
}

/// Rank plus scope over an entity's room. An entity without a room is only
/// reachable by SITE_ADMIN.
pub(crate) fn authorize(
    conn: &Connection,
    ctx: &AuthContext,
    required: Role,
    room: Option<RoomId>,
    label: &str,
) -> Result<(), CustodyError> {
    let tree = TreeView(conn);
    PermissionEvaluator::new(&tree).ensure(ctx, required, &ScopeTarget::maybe_room(room), label)
}

pub(crate) fn require_user(conn: &Connection, public_id: &str) -> Result<UserRow, CustodyError> {
    users::get_user(conn, public_id)?.ok_or_else(|| CustodyError::not_found(format!("user {}", public_id)))
}

/// Re-read a user inside the transaction
pub(crate) fn reload_user(conn: &Connection, user: &UserRow) -> Result<UserRow, CustodyError> {
    users::get_user_by_id(conn, user.id)?
        .ok_or_else(|| CustodyError::not_found(format!("user {}", user.public_id)))
}

#[derive(Debug, Clone, Serialize)]
pub struct HeldEquipment {
    pub equipment: String,
    pub name: String,
    pub status: equipment::EquipmentStatus,
    pub assignment: String,
    pub assigned_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeldAccessory {
    pub accessory: String,
    pub name: String,
    pub assignment: String,
    pub quantity: i64,
    pub assigned_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeldConsumable {
    pub consumable: String,
    pub name: String,
    pub issue: String,
    pub quantity: i64,
    pub issued_quantity: i64,
    pub issued_at: String,
}

/// Everything the caller currently holds
#[derive(Debug, Clone, Default, Serialize)]
pub struct MyCustody {
    pub equipment: Vec<HeldEquipment>,
    pub accessories: Vec<HeldAccessory>,
    pub consumables: Vec<HeldConsumable>,
}

/// Service container for dependency injection
///
/// Holds all services with shared database connection.
/// Pass this to HttpServer for handler access.
pub struct Services {
    pub directory: Arc<DirectoryService>,
    pub roles: Arc<RoleService>,
    pub equipment: Arc<EquipmentService>,
    pub accessories: Arc<AccessoryService>,
    pub consumables: Arc<ConsumableService>,
    pub events: Arc<EventBus>,
    db: Arc<CustodyDb>,
}

impl Services {
    /// Create all services with default sinks
    pub fn new(db: Arc<CustodyDb>) -> Self {
        Self::with_deps(ServiceDeps::new(db, Arc::new(EventBus::new())))
    }

    pub fn with_deps(deps: ServiceDeps) -> Self {
        Self {
            directory: Arc::new(DirectoryService::new(deps.db.clone())),
            roles: Arc::new(RoleService::new(deps.clone())),
            equipment: Arc::new(EquipmentService::new(deps.clone())),
            accessories: Arc::new(AccessoryService::new(deps.clone())),
            consumables: Arc::new(ConsumableService::new(deps.clone())),
            events: deps.events.clone(),
            db: deps.db,
        }
    }

    /// Build the authorization context for one request
    pub fn context(&self, user_public_id: &str, assignment_public_id: Option<&str>) -> Result<AuthContext, CustodyError> {
        self.db
            .with_conn(|conn| AuthContext::resolve(conn, user_public_id, assignment_public_id))
    }

    /// The caller's open equipment assignments, accessory assignments and
    /// consumable issues. Needs no rank.
    pub fn my_custody(&self, ctx: &AuthContext) -> Result<MyCustody, CustodyError> {
        let holder = ctx.actor().id;
        self.db.with_conn(|conn| {
            let equipment = equipment::open_assignments_for_holder(conn, holder)?
                .into_iter()
                .map(|(e, a)| HeldEquipment {
                    equipment: e.public_id,
                    name: e.name,
                    status: e.status,
                    assignment: a.public_id,
                    assigned_at: a.assigned_at,
                })
                .collect();
            let accessories = accessories::open_assignments_for_holder(conn, holder)?
                .into_iter()
                .map(|(acc, a)| HeldAccessory {
                    accessory: acc.public_id,
                    name: acc.name,
                    assignment: a.public_id,
                    quantity: a.quantity,
                    assigned_at: a.assigned_at,
                })
                .collect();
            let consumables = consumables::open_issues_for_holder(conn, holder)?
                .into_iter()
                .map(|(c, i)| HeldConsumable {
                    consumable: c.public_id,
                    name: c.name,
                    issue: i.public_id,
                    quantity: i.quantity,
                    issued_quantity: i.issued_quantity,
                    issued_at: i.issued_at,
                })
                .collect();
            Ok(MyCustody {
                equipment,
                accessories,
                consumables,
            })
        })
    }
}
