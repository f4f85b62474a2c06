//! Role ranks and the scope tier each role is bound to

use serde::{Deserialize, Serialize};
use std::fmt;

/// Roles in ascending rank order.
///
/// The derived `Ord` follows declaration order, so `a >= b` is the rank
/// comparison used throughout the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Role {
    RoomViewer = 0,
    RoomClerk = 1,
    RoomAdmin = 2,
    LocationViewer = 3,
    LocationAdmin = 4,
    DepartmentViewer = 5,
    DepartmentAdmin = 6,
    SiteAdmin = 7,
}

/// Level of the Department → Location → Room tree a role is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Room,
    Location,
    Department,
    Site,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::RoomViewer,
        Role::RoomClerk,
        Role::RoomAdmin,
        Role::LocationViewer,
        Role::LocationAdmin,
        Role::DepartmentViewer,
        Role::DepartmentAdmin,
        Role::SiteAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::RoomViewer => "ROOM_VIEWER",
            Role::RoomClerk => "ROOM_CLERK",
            Role::RoomAdmin => "ROOM_ADMIN",
            Role::LocationViewer => "LOCATION_VIEWER",
            Role::LocationAdmin => "LOCATION_ADMIN",
            Role::DepartmentViewer => "DEPARTMENT_VIEWER",
            Role::DepartmentAdmin => "DEPARTMENT_ADMIN",
            Role::SiteAdmin => "SITE_ADMIN",
        }
    }

    /// Parse a stored role name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Role> {
        Role::ALL.iter().copied().find(|r| r.as_str() == name)
    }

    pub fn tier(&self) -> Tier {
        match self {
            Role::RoomViewer | Role::RoomClerk | Role::RoomAdmin => Tier::Room,
            Role::LocationViewer | Role::LocationAdmin => Tier::Location,
            Role::DepartmentViewer | Role::DepartmentAdmin => Tier::Department,
            Role::SiteAdmin => Tier::Site,
        }
    }

    /// The next rank up. SITE_ADMIN is its own successor.
    pub fn successor(&self) -> Role {
        Role::ALL
            .get(*self as usize + 1)
            .copied()
            .unwrap_or(Role::SiteAdmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rank comparison. SITE_ADMIN satisfies every requirement.
pub fn has_rank(actor: Role, required: Role) -> bool {
    actor == Role::SiteAdmin || actor >= required
}

/// Rank comparison over stored role names; unknown names never pass.
pub fn has_rank_named(actor: &str, required: &str) -> bool {
    match (Role::parse(actor), Role::parse(required)) {
        (Some(actor), Some(required)) => has_rank(actor, required),
        _ => false,
    }
}
