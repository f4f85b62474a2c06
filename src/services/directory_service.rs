//! Directory service - scope tree and user administration
//!
//! Builds the Department → Location → Room tree and places users in rooms.
//! These operations shape the tree the evaluator reads; they are not gated
//! by it.

use std::sync::Arc;

use tracing::info;

use crate::auth::{RoleBinding, ScopeChain};
use crate::db::scope_tree::{self, CreateNodeInput, DepartmentRow, LocationRow, RoomRow, ScopeLocator};
use crate::db::users::{self, CreateUserInput, RoleAssignmentRow, UserRow};
use crate::db::CustodyDb;
use crate::error::CustodyError;

pub struct DirectoryService {
    db: Arc<CustodyDb>,
}

impl DirectoryService {
    pub fn new(db: Arc<CustodyDb>) -> Self {
        Self { db }
    }

    // =========================================================================
    // Scope tree
    // =========================================================================

    pub fn create_department(&self, input: CreateNodeInput) -> Result<DepartmentRow, CustodyError> {
        self.db.with_tx(|tx| scope_tree::create_department(tx, input))
    }

    pub fn create_location(&self, input: CreateNodeInput) -> Result<LocationRow, CustodyError> {
        self.db.with_tx(|tx| scope_tree::create_location(tx, input))
    }

    pub fn create_room(&self, input: CreateNodeInput) -> Result<RoomRow, CustodyError> {
        self.db.with_tx(|tx| scope_tree::create_room(tx, input))
    }

    pub fn relocate_room(&self, room: &str, location: &str) -> Result<RoomRow, CustodyError> {
        let row = self.db.with_tx(|tx| scope_tree::relocate_room(tx, room, location))?;
        info!(room = %room, location = %location, "Room relocated");
        Ok(row)
    }

    pub fn relocate_location(&self, location: &str, department: &str) -> Result<LocationRow, CustodyError> {
        let row = self.db.with_tx(|tx| scope_tree::relocate_location(tx, location, department))?;
        info!(location = %location, department = %department, "Location relocated");
        Ok(row)
    }

    pub fn delete_node(&self, locator: &ScopeLocator) -> Result<(), CustodyError> {
        self.db.with_tx(|tx| scope_tree::delete_node(tx, locator))?;
        info!(node = ?locator, "Scope node deleted");
        Ok(())
    }

    /// Current ancestor chain of a node
    pub fn resolve_chain(&self, locator: &ScopeLocator) -> Result<ScopeChain, CustodyError> {
        self.db.with_conn(|conn| scope_tree::resolve_chain(conn, locator))
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub fn create_user(&self, input: CreateUserInput) -> Result<UserRow, CustodyError> {
        self.db.with_tx(|tx| users::create_user(tx, input))
    }

    /// Make `user` the first SITE_ADMIN, creating the user if needed.
    /// Refused once any SITE_ADMIN exists.
    pub fn bootstrap_site_admin(&self, user: &str, display_name: &str) -> Result<RoleAssignmentRow, CustodyError> {
        let row = self.db.with_tx(|tx| {
            if !users::site_admins(tx)?.is_empty() {
                return Err(CustodyError::invalid("user", "a site administrator already exists"));
            }
            let row = match users::get_user(tx, user)? {
                Some(row) => row,
                None => users::create_user(
                    tx,
                    CreateUserInput {
                        public_id: Some(user.to_string()),
                        display_name: display_name.to_string(),
                        room: None,
                    },
                )?,
            };
            let assignment = users::create_role_assignment(tx, None, row.id, &RoleBinding::site_admin(), None)?;
            users::set_active_assignment(tx, row.id, Some(assignment.id))?;
            Ok(assignment)
        })?;
        info!(user = %user, "Bootstrapped site administrator");
        Ok(row)
    }

    /// Move a user to `room`, or out of every room
    pub fn move_user(&self, user: &str, room: Option<&str>) -> Result<UserRow, CustodyError> {
        self.db.with_tx(|tx| {
            let row = super::require_user(tx, user)?;
            let room = users::room_of(tx, room)?;
            users::set_user_room(tx, row.id, room)?;
            super::reload_user(tx, &row)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(pid: &str, parent: Option<&str>) -> CreateNodeInput {
        CreateNodeInput {
            public_id: Some(pid.into()),
            name: pid.to_lowercase(),
            parent: parent.map(str::to_string),
        }
    }

    #[test]
    fn test_move_user_between_rooms() {
        let service = DirectoryService::new(Arc::new(CustodyDb::open_in_memory().unwrap()));
        service.create_department(node("D1", None)).unwrap();
        service.create_location(node("L1", Some("D1"))).unwrap();
        let r1 = service.create_room(node("R1", Some("L1"))).unwrap();
        let r2 = service.create_room(node("R2", Some("L1"))).unwrap();
        service
            .create_user(CreateUserInput { public_id: Some("u1".into()), display_name: "U1".into(), room: Some("R1".into()) })
            .unwrap();

        let moved = service.move_user("u1", Some("R2")).unwrap();
        assert_eq!(moved.room_id, Some(r2.id));
        assert_ne!(moved.room_id, Some(r1.id));

        let cleared = service.move_user("u1", None).unwrap();
        assert_eq!(cleared.room_id, None);

        assert!(matches!(service.move_user("ghost", None), Err(CustodyError::NotFound(_))));
    }

    #[test]
    fn test_bootstrap_site_admin_only_once() {
        let service = DirectoryService::new(Arc::new(CustodyDb::open_in_memory().unwrap()));
        let first = service.bootstrap_site_admin("root", "Root").unwrap();
        assert_eq!(first.binding, RoleBinding::site_admin());

        let err = service.bootstrap_site_admin("other", "Other").unwrap_err();
        assert!(matches!(err, CustodyError::InvalidRequest { field: "user", .. }));
    }
}
