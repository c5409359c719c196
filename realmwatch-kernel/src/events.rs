/**
 * EVENEMENTS KERNEL - Interface explicite de notification
 *
 * RÔLE : Remplace les hooks implicites "on inserted/updated" d'un framework
 * de stockage. Chaque composant publie ses changements vers un `EventSink`
 * injecté au démarrage ; le sink par défaut se contente de tracer.
 */

use serde::Serialize;

use crate::models::RealmId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    RealmCreated { realm: RealmId },
    RealmUpdated { realm: RealmId },
    RealmDeleted { realm: RealmId },
    LiveStateChanged { realm: RealmId, entry: String },
    SynthesisUpdated { realm: RealmId },
    RetentionWritten { written: u64, evicted: u64 },
}

impl KernelEvent {
    pub fn realm(&self) -> Option<&str> {
        match self {
            KernelEvent::RealmCreated { realm }
            | KernelEvent::RealmUpdated { realm }
            | KernelEvent::RealmDeleted { realm }
            | KernelEvent::LiveStateChanged { realm, .. }
            | KernelEvent::SynthesisUpdated { realm } => Some(realm),
            KernelEvent::RetentionWritten { .. } => None,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &KernelEvent);
}

/// Sink par défaut : trace les événements au niveau debug
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &KernelEvent) {
        tracing::debug!(event = ?event, "[events] published");
    }
}
