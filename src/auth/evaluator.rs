//! Permission evaluator
//!
//! Decides whether the active role binding of a request may act on a target
//! located somewhere in the Department → Location → Room tree.
//!
//! ## Rules
//!
//! - Rank: SITE_ADMIN passes everything, otherwise the fixed rank order.
//! - Scope: a binding covers its own node and every descendant. Authority
//!   never flows upward: a room binding does not cover its location.
//! - Ancestry is resolved through [`Ancestry`] on every call, so a node that
//!   was relocated after the binding was granted is judged by where it sits
//!   now.
//! - A detached binding (its node was deleted) covers nothing.

use serde::Serialize;

use super::context::AuthContext;
use super::roles::{has_rank, Role};
use super::scope::{
    Ancestry, DepartmentId, LocationId, RoleBinding, RoomId, Scope, ScopeChain, ScopeTarget,
};
use crate::error::CustodyError;

/// Entity kinds that can be filtered by scope in list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Equipment,
    Accessory,
    Consumable,
}

impl EntityKind {
    /// Column holding the entity's room, qualified by table name.
    pub fn room_column(&self) -> &'static str {
        match self {
            EntityKind::Equipment => "equipment.room_id",
            EntityKind::Accessory => "accessories.room_id",
            EntityKind::Consumable => "consumables.room_id",
        }
    }
}

/// Containment predicate equivalent to [`PermissionEvaluator::in_scope`],
/// expressed over an entity's room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ScopeFilter {
    Unrestricted,
    Nothing,
    Room(RoomId),
    Location(LocationId),
    Department(DepartmentId),
}

impl ScopeFilter {
    /// Render as an SQL condition plus its bound parameters.
    ///
    /// Sub-selects read the live tree, so relocations are honoured the same
    /// way the evaluator honours them.
    pub fn to_sql(&self, kind: EntityKind) -> (String, Vec<i64>) {
        let column = kind.room_column();
        match self {
            ScopeFilter::Unrestricted => ("1 = 1".to_string(), vec![]),
            ScopeFilter::Nothing => ("1 = 0".to_string(), vec![]),
            ScopeFilter::Room(r) => (format!("{} = ?", column), vec![r.0]),
            ScopeFilter::Location(l) => (
                format!("{} IN (SELECT id FROM rooms WHERE location_id = ?)", column),
                vec![l.0],
            ),
            ScopeFilter::Department(d) => (
                format!(
                    "{} IN (SELECT rooms.id FROM rooms \
                     JOIN locations ON rooms.location_id = locations.id \
                     WHERE locations.department_id = ?)",
                    column
                ),
                vec![d.0],
            ),
        }
    }
}

/// Evaluator bound to a view of the scope tree.
pub struct PermissionEvaluator<'a, A: Ancestry + ?Sized> {
    tree: &'a A,
}

impl<'a, A: Ancestry + ?Sized> PermissionEvaluator<'a, A> {
    pub fn new(tree: &'a A) -> Self {
        Self { tree }
    }

    pub fn has_rank(&self, actor: Role, required: Role) -> bool {
        has_rank(actor, required)
    }

    /// Whether `binding` covers any tier supplied in `target`.
    pub fn in_scope(&self, binding: &RoleBinding, target: &ScopeTarget) -> Result<bool, CustodyError> {
        let assigned = match binding.scope() {
            Scope::Site => return Ok(true),
            Scope::Detached => return Ok(false),
            scope => scope,
        };

        if let Some(room) = target.room {
            if self.tree.chain_from_room(room)?.passes_through(assigned) {
                return Ok(true);
            }
        }
        if let Some(location) = target.location {
            if self.tree.chain_from_location(location)?.passes_through(assigned) {
                return Ok(true);
            }
        }
        if let Some(department) = target.department {
            let chain = ScopeChain {
                department: Some(department),
                ..Default::default()
            };
            if chain.passes_through(assigned) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Rank and scope. No active binding never passes.
    pub fn check(
        &self,
        ctx: &AuthContext,
        required: Role,
        target: &ScopeTarget,
    ) -> Result<bool, CustodyError> {
        let Some(binding) = ctx.binding() else {
            return Ok(false);
        };
        if !self.has_rank(binding.role(), required) {
            return Ok(false);
        }
        self.in_scope(binding, target)
    }

    /// Like [`check`](Self::check) but fails with `Forbidden` naming the
    /// required role and the target label.
    pub fn ensure(
        &self,
        ctx: &AuthContext,
        required: Role,
        target: &ScopeTarget,
        label: &str,
    ) -> Result<(), CustodyError> {
        if self.check(ctx, required, target)? {
            Ok(())
        } else {
            tracing::debug!(
                actor = %ctx.actor().public_id,
                required = %required,
                target = %label,
                "Permission denied"
            );
            Err(CustodyError::Forbidden {
                required,
                target: label.to_string(),
            })
        }
    }

    /// Filter for list operations, selecting the tier the active binding
    /// occupies.
    pub fn scope_filter(&self, ctx: &AuthContext) -> ScopeFilter {
        match ctx.binding().map(|b| b.scope()) {
            Some(Scope::Site) => ScopeFilter::Unrestricted,
            Some(Scope::Department(d)) => ScopeFilter::Department(d),
            Some(Scope::Location(l)) => ScopeFilter::Location(l),
            Some(Scope::Room(r)) => ScopeFilter::Room(r),
            Some(Scope::Detached) | None => ScopeFilter::Nothing,
        }
    }
}
