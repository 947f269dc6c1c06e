//! Patch-complete notifications
//!
//! Every load publishes one [`PatchEvent`] after its sweep has run. Host code
//! subscribes with [`EventBus::subscribe`] and receives events on a crossbeam
//! channel; subscribers that dropped their receiver are pruned on the next
//! publish.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::image::{ClassId, ModuleId};

/// A module finished patching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEvent {
    /// The loaded module
    pub module: ModuleId,
    /// Its load sequence number
    pub sequence: u64,
    /// Descriptors the module installed
    pub classes: Vec<ClassId>,
    /// Type names of those descriptors
    pub class_names: Vec<String>,
    /// Symbols whose call sites were rebound
    pub rebound: Vec<String>,
}

/// Publish/subscribe hub for [`PatchEvent`]s
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PatchEvent>>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<PatchEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: PatchEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
