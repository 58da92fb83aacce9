//! # Bus Service Controllers
//!
//! One submodule per service kind (CAN, LIN, FlexRay, Ethernet, generic
//! data, RPC) plus the plumbing they all share: the handler registry with
//! opaque removal ids, the endpoint descriptor, the controller dispatch
//! trait, and the trace-sink hook.
//!
//! ## Handler identity
//!
//! Handler registration returns an opaque [`HandlerId`]; removal is by id.
//! Removal by function pointer is deliberately unsupported. Handlers are
//! invoked outside of any internal lock so that a handler may call back
//! into controller APIs without deadlocking.
//!
//! ## Simple-mode semantics
//!
//! With no detailed network simulator attached to a link, the controllers
//! themselves provide the per-bus protocol semantics (CAN acknowledgement,
//! LIN frame-response resolution, FlexRay POC transitions, Ethernet VLAN
//! switch forwarding). A detailed simulator replaces this per link through
//! the routing core's attach seam.

pub mod can;
pub mod data;
pub mod ethernet;
pub mod flexray;
pub mod lin;
pub mod rpc;

use crate::types::{Direction, EndpointAddress, Label, ServiceKind};
use crate::wire::{Envelope, SubscriptionAnnouncement};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque identifier of a registered handler.
pub type HandlerId = u64;

/// Registry of event handlers with opaque-id removal.
///
/// Invocation clones the handler references out of the lock before calling
/// them, so a handler may register or remove handlers on the same
/// controller re-entrantly.
pub struct HandlerRegistry<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(HandlerId, Arc<dyn Fn(&E) + Send + Sync>)>>,
}

impl<E> Default for HandlerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> HandlerRegistry<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler; returns the id used for removal.
    pub fn add(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler by id. Returns whether it existed.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Invoke every registered handler with the event.
    pub fn invoke(&self, event: &E) {
        let handlers: Vec<Arc<dyn Fn(&E) + Send + Sync>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Static description of one local controller endpoint.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub qualified_name: String,
    pub link: String,
    pub kind: ServiceKind,
    pub labels: Vec<Label>,
    pub media_type: Option<String>,
    pub history: u8,
    /// Names of the trace sinks this controller writes to
    pub trace_sinks: Vec<String>,
}

impl EndpointDescriptor {
    /// The announcement broadcast to peers when this endpoint registers.
    pub fn announcement(&self) -> SubscriptionAnnouncement {
        SubscriptionAnnouncement {
            address: self.address,
            qualified_name: self.qualified_name.clone(),
            link: self.link.clone(),
            kind: self.kind,
            labels: self.labels.clone(),
            media_type: self.media_type.clone(),
            history: self.history,
        }
    }
}

/// Dispatch interface every controller implements toward the participant
/// core. Envelope handling runs on the participant's dispatch task, so
/// implementations observe a sequential execution model.
pub(crate) trait BusController: Send + Sync {
    /// The endpoint this controller registered as.
    fn descriptor(&self) -> &EndpointDescriptor;

    /// Deliver one link-routed or directed envelope.
    fn handle_envelope(&self, envelope: &Envelope);

    /// A previously unknown remote endpoint appeared on the bus.
    fn on_remote_endpoint(&self, _announcement: &SubscriptionAnnouncement) {}
}

/// Hook for trace sinks (MDF4/PCAP writers live outside the core).
///
/// Controllers hand every sent and received envelope to the sinks named in
/// their configuration; the sink decides representation and persistence.
pub trait TraceSink: Send + Sync {
    /// The configured sink name this implementation serves.
    fn name(&self) -> &str;

    /// Record one message. `direction` is relative to the traced
    /// controller: `Tx` for messages it sent, `Rx` for deliveries.
    fn trace(&self, direction: Direction, envelope: &Envelope);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handler_add_invoke_remove() {
        let registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = registry.add(move |value| {
            hits_clone.fetch_add(*value as usize, Ordering::Relaxed);
        });

        registry.invoke(&2);
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        assert!(registry.remove(id));
        registry.invoke(&2);
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        // Removing twice reports absence
        assert!(!registry.remove(id));
    }

    #[test]
    fn test_handler_ids_are_unique() {
        let registry: HandlerRegistry<()> = HandlerRegistry::new();
        let a = registry.add(|_| {});
        let b = registry.add(|_| {});
        assert_ne!(a, b);
    }

    #[test]
    fn test_reentrant_removal_from_handler() {
        let registry: Arc<HandlerRegistry<()>> = Arc::new(HandlerRegistry::new());
        let registry_clone = Arc::clone(&registry);
        let id = Arc::new(AtomicU64::new(0));
        let id_clone = Arc::clone(&id);

        let handler_id = registry.add(move |_| {
            registry_clone.remove(id_clone.load(Ordering::Relaxed));
        });
        id.store(handler_id, Ordering::Relaxed);

        // Must not deadlock; the handler removes itself
        registry.invoke(&());
        assert!(registry.is_empty());
    }
}
