/*!
Sink d'événements enregistreur

Remplace le `TracingSink` dans les tests : garde chaque `KernelEvent` publié
pour permettre des assertions après coup.
*/

use parking_lot::Mutex;
use realmwatch_kernel::events::{EventSink, KernelEvent};

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<KernelEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tous les événements publiés, dans l'ordre
    pub fn events(&self) -> Vec<KernelEvent> {
        self.events.lock().clone()
    }

    pub fn count_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn synthesis_updates_for(&self, realm: &str) -> usize {
        self.count_matching(|e| matches!(e, KernelEvent::SynthesisUpdated { realm: r } if r == realm))
    }

    pub fn last(&self) -> Option<KernelEvent> {
        self.events.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &KernelEvent) {
        tracing::debug!(event = ?event, "[devkit] recorded");
        self.events.lock().push(event.clone());
    }
}
