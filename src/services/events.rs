//! Post-commit event bus
//!
//! Services emit a [`CustodyEvent`] for every ledger row they commit. Emission
//! happens after the transaction is durable and never fails the operation.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::auth::Role;
use crate::db::equipment::EquipmentStatus;
use crate::db::EventType;

/// Custody events emitted by services
#[derive(Debug, Clone)]
pub enum CustodyEvent {
    // Equipment
    EquipmentAssigned {
        equipment: String,
        holder: String,
        actor: String,
    },
    EquipmentReturned {
        equipment: String,
        holder: String,
        actor: String,
    },
    EquipmentStatusChanged {
        equipment: String,
        status: EquipmentStatus,
        actor: String,
    },

    // Quantity ledgers
    AccessoryLedger {
        accessory: String,
        event_type: EventType,
        holder: Option<String>,
        quantity: i64,
        quantity_change: i64,
    },
    ConsumableLedger {
        consumable: String,
        event_type: EventType,
        holder: Option<String>,
        quantity: i64,
        quantity_change: i64,
    },

    // Role administration
    RoleGranted {
        assignment: String,
        user: String,
        role: Role,
    },
    RoleRevoked {
        assignment: String,
        user: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CustodyEvent);
}

/// Event bus for broadcasting committed custody events
pub struct EventBus {
    sender: broadcast::Sender<CustodyEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: CustodyEvent) {
        trace!(event = ?event, "Emitting custody event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = CustodyEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CustodyEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every committed custody event
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &CustodyEvent) {
        match event {
            CustodyEvent::EquipmentAssigned { equipment, holder, actor } => {
                debug!(equipment = %equipment, holder = %holder, actor = %actor, "Equipment assigned");
            }
            CustodyEvent::EquipmentReturned { equipment, holder, actor } => {
                debug!(equipment = %equipment, holder = %holder, actor = %actor, "Equipment returned");
            }
            CustodyEvent::ConsumableLedger {
                consumable,
                event_type,
                quantity,
                quantity_change,
                ..
            } => {
                debug!(
                    consumable = %consumable,
                    event = %event_type,
                    quantity,
                    quantity_change,
                    "Consumable ledger"
                );
            }
            _ => {
                trace!(event = ?event, "Custody event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
