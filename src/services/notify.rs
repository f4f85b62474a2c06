//! Notification sink
//!
//! Recipients are resolved inside the custody transaction; delivery happens
//! after commit. A delivery failure is logged and dropped.

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::{Ancestry, RoomId, ScopeChain};
use crate::db::scope_tree::TreeView;
use crate::db::users::{self, UserRow};
use crate::db::EventType;
use crate::error::CustodyError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub public_id: String,
    pub display_name: String,
}

impl From<UserRow> for Recipient {
    fn from(user: UserRow) -> Self {
        Self {
            public_id: user.public_id,
            display_name: user.display_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A holder reported units of their own issue as lost or spoiled
    ConsumableLossReported {
        consumable: String,
        holder: String,
        event_type: EventType,
        quantity: i64,
    },
    LowStock {
        consumable: String,
        quantity: i64,
        threshold: i64,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, recipients: &[Recipient], notification: &Notification) -> Result<(), CustodyError>;
}

/// Writes notifications to the log
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, recipients: &[Recipient], notification: &Notification) -> Result<(), CustodyError> {
        let to: Vec<&str> = recipients.iter().map(|r| r.public_id.as_str()).collect();
        info!(recipients = ?to, notification = ?notification, "Notification");
        Ok(())
    }
}

/// A notification waiting for its transaction to commit
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub recipients: Vec<Recipient>,
    pub notification: Notification,
}

impl PendingNotification {
    /// Deliver, logging instead of failing
    pub fn dispatch(self, notifier: &dyn Notifier) {
        if self.recipients.is_empty() {
            warn!(notification = ?self.notification, "Notification has no recipients");
            return;
        }
        if let Err(e) = notifier.notify(&self.recipients, &self.notification) {
            warn!(error = %e, notification = ?self.notification, "Notification delivery failed");
        }
    }
}

/// Administrators responsible for `room`: room, location and department
/// admins whose scope contains it. Falls back to SITE_ADMIN users when the
/// room is unset or nobody administers it.
pub fn responsible_administrators(conn: &Connection, room: Option<RoomId>) -> Result<Vec<Recipient>, CustodyError> {
    let chain = match room {
        Some(room) => TreeView(conn).chain_from_room(room)?,
        None => ScopeChain::default(),
    };

    let mut admins = if chain.room.is_some() {
        users::administrators_for(conn, &chain)?
    } else {
        Vec::new()
    };
    if admins.is_empty() {
        admins = users::site_admins(conn)?;
    }
    Ok(admins.into_iter().map(Recipient::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Notification>>);

    impl Notifier for Recording {
        fn notify(&self, _recipients: &[Recipient], notification: &Notification) -> Result<(), CustodyError> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Failing;

    impl Notifier for Failing {
        fn notify(&self, _recipients: &[Recipient], _notification: &Notification) -> Result<(), CustodyError> {
            Err(CustodyError::Internal("mail relay down".into()))
        }
    }

    fn pending() -> PendingNotification {
        PendingNotification {
            recipients: vec![Recipient { public_id: "admin".into(), display_name: "Admin".into() }],
            notification: Notification::LowStock { consumable: "CON1".into(), quantity: 2, threshold: 5 },
        }
    }

    #[test]
    fn test_dispatch_delivers() {
        let notifier = Recording::default();
        pending().dispatch(&notifier);
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dispatch_swallows_failures() {
        pending().dispatch(&Failing);
    }

    #[test]
    fn test_dispatch_skips_empty_recipients() {
        let notifier = Recording::default();
        let mut p = pending();
        p.recipients.clear();
        p.dispatch(&notifier);
        assert!(notifier.0.lock().unwrap().is_empty());
    }
}
