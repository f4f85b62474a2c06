//! Scope model: tree node identifiers, role bindings and ancestor chains

use serde::{Deserialize, Serialize};
use std::fmt;

use super::roles::{Role, Tier};
use crate::error::CustodyError;

macro_rules! node_id {
    ($name:ident, $label:literal) => {
        /// Internal row id of a scope tree node.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }
    };
}

node_id!(DepartmentId, "department");
node_id!(LocationId, "location");
node_id!(RoomId, "room");

/// The node a role assignment is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tier", content = "id", rename_all = "snake_case")]
pub enum Scope {
    /// SITE_ADMIN only; no node.
    Site,
    Department(DepartmentId),
    Location(LocationId),
    Room(RoomId),
    /// The bound node was deleted after the assignment was created.
    /// Matches no target.
    Detached,
}

impl Scope {
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Scope::Site => Some(Tier::Site),
            Scope::Department(_) => Some(Tier::Department),
            Scope::Location(_) => Some(Tier::Location),
            Scope::Room(_) => Some(Tier::Room),
            Scope::Detached => None,
        }
    }
}

/// A role together with the node it is bound to.
///
/// Construction through [`RoleBinding::new`] enforces that the scope tier
/// matches the role tier; SITE_ADMIN carries no node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RoleBinding {
    role: Role,
    scope: Scope,
}

impl RoleBinding {
    pub fn new(role: Role, scope: Scope) -> Result<Self, CustodyError> {
        match scope.tier() {
            Some(tier) if tier == role.tier() => Ok(Self { role, scope }),
            Some(_) => Err(CustodyError::invalid(
                "scope",
                format!("{} must be bound at the {:?} tier", role, role.tier()),
            )),
            None => Err(CustodyError::invalid("scope", "a scope node is required")),
        }
    }

    /// Rebuild a binding read back from storage. A tier-appropriate foreign
    /// key that has been nulled out yields a detached binding.
    pub(crate) fn from_stored(role: Role, scope: Option<Scope>) -> Self {
        let scope = match scope {
            Some(scope) if scope.tier() == Some(role.tier()) => scope,
            _ => Scope::Detached,
        };
        Self { role, scope }
    }

    pub fn site_admin() -> Self {
        Self {
            role: Role::SiteAdmin,
            scope: Scope::Site,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }
}

/// Target locator handed to the evaluator. Any subset of tiers may be set;
/// the check passes if any supplied tier is covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ScopeTarget {
    pub room: Option<RoomId>,
    pub location: Option<LocationId>,
    pub department: Option<DepartmentId>,
}

impl ScopeTarget {
    pub fn room(room: RoomId) -> Self {
        Self {
            room: Some(room),
            ..Default::default()
        }
    }

    /// Target for an entity whose room may be unset.
    pub fn maybe_room(room: Option<RoomId>) -> Self {
        Self {
            room,
            ..Default::default()
        }
    }

    pub fn location(location: LocationId) -> Self {
        Self {
            location: Some(location),
            ..Default::default()
        }
    }

    pub fn department(department: DepartmentId) -> Self {
        Self {
            department: Some(department),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.room.is_none() && self.location.is_none() && self.department.is_none()
    }
}

impl From<Scope> for ScopeTarget {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Department(d) => ScopeTarget::department(d),
            Scope::Location(l) => ScopeTarget::location(l),
            Scope::Room(r) => ScopeTarget::room(r),
            Scope::Site | Scope::Detached => ScopeTarget::default(),
        }
    }
}

/// Current ancestors of a node, finest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeChain {
    pub room: Option<RoomId>,
    pub location: Option<LocationId>,
    pub department: Option<DepartmentId>,
}

impl ScopeChain {
    /// Whether `scope` is this chain's node or one of its ancestors.
    pub fn passes_through(&self, scope: Scope) -> bool {
        match scope {
            Scope::Site => true,
            Scope::Department(d) => self.department == Some(d),
            Scope::Location(l) => self.location == Some(l),
            Scope::Room(r) => self.room == Some(r),
            Scope::Detached => false,
        }
    }
}

/// Parent lookups against the current state of the tree.
///
/// Implementations must read live data; callers rely on relocations being
/// visible immediately.
pub trait Ancestry {
    fn location_of_room(&self, room: RoomId) -> Result<Option<LocationId>, CustodyError>;
    fn department_of_location(
        &self,
        location: LocationId,
    ) -> Result<Option<DepartmentId>, CustodyError>;

    fn chain_from_room(&self, room: RoomId) -> Result<ScopeChain, CustodyError> {
        let location = self.location_of_room(room)?;
        let department = match location {
            Some(l) => self.department_of_location(l)?,
            None => None,
        };
        Ok(ScopeChain {
            room: Some(room),
            location,
            department,
        })
    }

    fn chain_from_location(&self, location: LocationId) -> Result<ScopeChain, CustodyError> {
        Ok(ScopeChain {
            room: None,
            location: Some(location),
            department: self.department_of_location(location)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_requires_matching_tier() {
        assert!(RoleBinding::new(Role::RoomClerk, Scope::Room(RoomId(1))).is_ok());
        assert!(RoleBinding::new(Role::LocationAdmin, Scope::Location(LocationId(1))).is_ok());
        assert!(RoleBinding::new(Role::DepartmentViewer, Scope::Department(DepartmentId(1))).is_ok());
        assert!(RoleBinding::new(Role::SiteAdmin, Scope::Site).is_ok());

        assert!(RoleBinding::new(Role::RoomClerk, Scope::Location(LocationId(1))).is_err());
        assert!(RoleBinding::new(Role::DepartmentAdmin, Scope::Room(RoomId(1))).is_err());
        assert!(RoleBinding::new(Role::SiteAdmin, Scope::Department(DepartmentId(1))).is_err());
        assert!(RoleBinding::new(Role::RoomAdmin, Scope::Site).is_err());
        assert!(RoleBinding::new(Role::RoomAdmin, Scope::Detached).is_err());
    }

    #[test]
    fn test_from_stored_detaches_missing_node() {
        let binding = RoleBinding::from_stored(Role::RoomAdmin, None);
        assert_eq!(binding.scope(), Scope::Detached);

        let binding = RoleBinding::from_stored(Role::RoomAdmin, Some(Scope::Room(RoomId(4))));
        assert_eq!(binding.scope(), Scope::Room(RoomId(4)));

        let binding = RoleBinding::from_stored(Role::SiteAdmin, Some(Scope::Site));
        assert_eq!(binding.scope(), Scope::Site);
    }

    #[test]
    fn test_chain_passes_through() {
        let chain = ScopeChain {
            room: Some(RoomId(3)),
            location: Some(LocationId(2)),
            department: Some(DepartmentId(1)),
        };
        assert!(chain.passes_through(Scope::Room(RoomId(3))));
        assert!(chain.passes_through(Scope::Location(LocationId(2))));
        assert!(chain.passes_through(Scope::Department(DepartmentId(1))));
        assert!(!chain.passes_through(Scope::Department(DepartmentId(9))));
        assert!(!chain.passes_through(Scope::Detached));
    }
}
