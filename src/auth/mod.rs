//! Roles, scopes and the permission evaluator

pub mod context;
pub mod evaluator;
pub mod roles;
pub mod scope;

pub use context::{Actor, AuthContext};
pub use evaluator::{EntityKind, PermissionEvaluator, ScopeFilter};
pub use roles::{has_rank, has_rank_named, Role, Tier};
pub use scope::{
    Ancestry, DepartmentId, LocationId, RoleBinding, RoomId, Scope, ScopeChain, ScopeTarget,
};
