//! Request-scoped authorization context
//!
//! Built once per call from the caller's identity and the role assignment
//! they act under, then passed explicitly to the evaluator and the services.
//! Nothing about the "current role" is kept on long-lived state.

use rusqlite::Connection;
use serde::Serialize;

use super::scope::RoleBinding;
use crate::db::users;
use crate::error::CustodyError;

/// The user a request acts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actor {
    #[serde(skip)]
    pub id: i64,
    pub public_id: String,
    pub display_name: String,
}

impl Actor {
    pub fn new(id: i64, public_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id,
            public_id: public_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Actor plus the binding that governs this request, if any
#[derive(Debug, Clone)]
pub struct AuthContext {
    actor: Actor,
    binding: Option<RoleBinding>,
}

impl AuthContext {
    pub fn new(actor: Actor, binding: Option<RoleBinding>) -> Self {
        Self { actor, binding }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn binding(&self) -> Option<&RoleBinding> {
        self.binding.as_ref()
    }

    /// Build the context for `user_public_id`.
    ///
    /// An explicit assignment must belong to the user. Without one the
    /// user's active assignment is used; a user with neither gets a context
    /// that passes no scoped check.
    pub fn resolve(
        conn: &Connection,
        user_public_id: &str,
        assignment_public_id: Option<&str>,
    ) -> Result<Self, CustodyError> {
        let user = users::get_user(conn, user_public_id)?
            .ok_or_else(|| CustodyError::Auth(format!("unknown actor {}", user_public_id)))?;

        let assignment = match assignment_public_id {
            Some(pid) => {
                let assignment = users::get_role_assignment(conn, pid)?
                    .filter(|a| a.user_id == user.id)
                    .ok_or_else(|| {
                        CustodyError::Auth(format!("role assignment {} is not held by the actor", pid))
                    })?;
                Some(assignment)
            }
            None => match user.active_assignment_id {
                Some(id) => users::get_role_assignment_by_id(conn, id)?,
                None => None,
            },
        };

        Ok(Self {
            actor: Actor::new(user.id, user.public_id, user.display_name),
            binding: assignment.map(|a| a.binding),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, Scope};
    use crate::db::scope_tree::{create_department, CreateNodeInput};
    use crate::db::users::{create_role_assignment, create_user, set_active_assignment, CreateUserInput};
    use crate::db::CustodyDb;

    fn user(conn: &Connection, pid: &str) -> users::UserRow {
        create_user(
            conn,
            CreateUserInput { public_id: Some(pid.into()), display_name: pid.into(), room: None },
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_unknown_actor_is_auth_error() {
        let db = CustodyDb::open_in_memory().unwrap();
        let err = db.with_conn(|conn| AuthContext::resolve(conn, "ghost", None)).unwrap_err();
        assert!(matches!(err, CustodyError::Auth(_)));
    }

    #[test]
    fn test_resolve_uses_active_assignment() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let u = user(conn, "u1");
            let ctx = AuthContext::resolve(conn, "u1", None)?;
            assert!(ctx.binding().is_none());

            let ra = create_role_assignment(conn, None, u.id, &RoleBinding::site_admin(), None)?;
            set_active_assignment(conn, u.id, Some(ra.id))?;
            let ctx = AuthContext::resolve(conn, "u1", None)?;
            assert_eq!(ctx.binding().map(|b| b.role()), Some(Role::SiteAdmin));
            assert_eq!(ctx.actor().public_id, "u1");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_resolve_explicit_assignment_must_be_owned() {
        let db = CustodyDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let d = create_department(
                conn,
                CreateNodeInput { public_id: Some("D1".into()), name: "Eng".into(), parent: None },
            )?;
            let owner = user(conn, "owner");
            user(conn, "other");
            let binding = RoleBinding::new(Role::DepartmentViewer, Scope::Department(d.node()))?;
            create_role_assignment(conn, Some("RA1".into()), owner.id, &binding, None)?;

            let ctx = AuthContext::resolve(conn, "owner", Some("RA1"))?;
            assert_eq!(ctx.binding(), Some(&binding));

            let err = AuthContext::resolve(conn, "other", Some("RA1")).unwrap_err();
            assert!(matches!(err, CustodyError::Auth(_)));
            Ok(())
        })
        .unwrap();
    }
}
