//! Role service - granting, activating and revoking role assignments
//!
//! Granting needs strict seniority: the actor must outrank the role being
//! handed out (SITE_ADMIN may grant anything) and the target node must sit
//! inside the actor's jurisdiction.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::auth::{AuthContext, PermissionEvaluator, Role, RoleBinding, Scope, ScopeTarget};
use crate::db::scope_tree::{self, ScopeLocator, TreeView};
use crate::db::users::{self, RoleAssignmentRow};
use crate::error::CustodyError;

use super::audit::AuditEntry;
use super::events::CustodyEvent;
use super::ServiceDeps;

/// Input for granting a role
#[derive(Debug, Clone, Deserialize)]
pub struct GrantRoleInput {
    #[serde(default)]
    pub public_id: Option<String>,
    pub user: String,
    pub role: Role,
    /// Omitted for SITE_ADMIN
    #[serde(default)]
    pub scope: Option<ScopeLocator>,
}

pub struct RoleService {
    deps: ServiceDeps,
}

fn room_of_scope(scope: Scope) -> Option<crate::auth::RoomId> {
    match scope {
        Scope::Room(r) => Some(r),
        _ => None,
    }
}

impl RoleService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self { deps }
    }

    /// The actor's own assignments
    pub fn assignments(&self, ctx: &AuthContext) -> Result<Vec<RoleAssignmentRow>, CustodyError> {
        self.deps
            .db
            .with_conn(|conn| users::list_role_assignments(conn, ctx.actor().id))
    }

    /// Grant `input.role` to `input.user` at `input.scope`.
    ///
    /// The user's first assignment becomes their active one.
    pub fn grant(&self, ctx: &AuthContext, input: GrantRoleInput) -> Result<RoleAssignmentRow, CustodyError> {
        debug!(actor = %ctx.actor().public_id, user = %input.user, role = %input.role, "Granting role");

        let row = self.deps.db.with_tx(|tx| {
            let binding = match (input.role, &input.scope) {
                (Role::SiteAdmin, None) => RoleBinding::site_admin(),
                (Role::SiteAdmin, Some(_)) => {
                    return Err(CustodyError::invalid("scope", "SITE_ADMIN is not bound to a node"));
                }
                (_, None) => return Err(CustodyError::invalid("scope", "a scope node is required")),
                (role, Some(locator)) => RoleBinding::new(role, scope_tree::resolve_scope(tx, locator)?)?,
            };

            let tree = TreeView(tx);
            PermissionEvaluator::new(&tree).ensure(
                ctx,
                input.role.successor(),
                &ScopeTarget::from(binding.scope()),
                &format!("granting {}", input.role),
            )?;

            let user = super::require_user(tx, &input.user)?;
            let row = users::create_role_assignment(tx, input.public_id.clone(), user.id, &binding, Some(ctx.actor().id))?;
            if user.active_assignment_id.is_none() {
                users::set_active_assignment(tx, user.id, Some(row.id))?;
            }

            self.deps.record(
                tx,
                ctx,
                AuditEntry {
                    action: "role.grant",
                    target_kind: "user",
                    target_public_id: user.public_id.clone(),
                    target_name: user.display_name.clone(),
                    room: room_of_scope(binding.scope()),
                    details: json!({ "assignment": row.public_id, "role": input.role, "scope": binding.scope() }),
                },
            )?;
            Ok(row)
        })?;

        self.deps.events.emit(CustodyEvent::RoleGranted {
            assignment: row.public_id.clone(),
            user: input.user,
            role: input.role,
        });
        Ok(row)
    }

    /// Make one of the actor's own assignments the active one
    pub fn activate(&self, ctx: &AuthContext, assignment: &str) -> Result<RoleAssignmentRow, CustodyError> {
        self.deps.db.with_tx(|tx| {
            let row = users::get_role_assignment(tx, assignment)?
                .filter(|a| a.user_id == ctx.actor().id)
                .ok_or_else(|| CustodyError::not_found(format!("role assignment {}", assignment)))?;
            users::set_active_assignment(tx, ctx.actor().id, Some(row.id))?;
            debug!(actor = %ctx.actor().public_id, assignment = %assignment, "Activated role assignment");
            Ok(row)
        })
    }

    /// Remove an assignment. Requires the same authority as granting it.
    pub fn revoke(&self, ctx: &AuthContext, assignment: &str) -> Result<(), CustodyError> {
        let user = self.deps.db.with_tx(|tx| {
            let row = users::get_role_assignment(tx, assignment)?
                .ok_or_else(|| CustodyError::not_found(format!("role assignment {}", assignment)))?;

            let tree = TreeView(tx);
            PermissionEvaluator::new(&tree).ensure(
                ctx,
                row.binding.role().successor(),
                &ScopeTarget::from(row.binding.scope()),
                &format!("revoking {}", row.binding.role()),
            )?;

            let user = users::get_user_by_id(tx, row.user_id)?
                .ok_or_else(|| CustodyError::not_found(format!("user #{}", row.user_id)))?;
            users::delete_role_assignment(tx, row.id)?;

            self.deps.record(
                tx,
                ctx,
                AuditEntry {
                    action: "role.revoke",
                    target_kind: "user",
                    target_public_id: user.public_id.clone(),
                    target_name: user.display_name.clone(),
                    room: room_of_scope(row.binding.scope()),
                    details: json!({ "assignment": row.public_id, "role": row.binding.role() }),
                },
            )?;
            Ok(user)
        })?;

        self.deps.events.emit(CustodyEvent::RoleRevoked {
            assignment: assignment.to_string(),
            user: user.public_id,
        });
        Ok(())
    }
}
