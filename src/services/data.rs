//! # Generic Data Publish/Subscribe Service
//!
//! Opaque byte payloads on a topic (link) with a media-type string and a
//! label set. Publisher-side routing only targets peers with a matching
//! subscriber; subscriber-side dispatch first tries the registered
//! *specific* handlers (keyed on a distinct label pattern that narrows the
//! general subscription) and falls back to the default handlers.
//!
//! A publisher with `history = 1` caches its last payload and replays it,
//! with the original timestamp, directly to any matching subscriber that
//! appears later. Subscribers are notified through the `NewDataSource`
//! handler the first time a previously unseen matching publisher appears.

use crate::error::IbResult;
use crate::participant::BusHandle;
use crate::services::{BusController, EndpointDescriptor, HandlerId, HandlerRegistry};
use crate::types::{labels_match, specific_labels_match, EndpointAddress, Label, NanosecondsTime, ServiceKind};
use crate::wire::{Envelope, Payload, SubscriptionAnnouncement};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One published payload on a data topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessageEvent {
    pub data: Vec<u8>,
    /// The publisher's labels, carried for subscriber-side handler selection
    pub labels: Vec<Label>,
    pub media_type: String,
    /// Publication time; history replay preserves the original value
    pub timestamp_ns: NanosecondsTime,
}

/// Notification that a new matching publisher appeared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataSourceEvent {
    pub qualified_name: String,
    pub labels: Vec<Label>,
    pub media_type: String,
}

/// A data publisher endpoint.
#[derive(Clone)]
pub struct DataPublisher {
    inner: Arc<DataPublisherInner>,
}

pub(crate) struct DataPublisherInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    sequence: AtomicU64,
    /// Last payload and its timestamp, kept when `history = 1`
    cache: Mutex<Option<(Vec<u8>, NanosecondsTime)>>,
}

impl DataPublisher {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
    ) -> (Self, Arc<DataPublisherInner>) {
        let inner = Arc::new(DataPublisherInner {
            descriptor,
            bus,
            sequence: AtomicU64::new(0),
            cache: Mutex::new(None),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Publish one payload to every presently matching subscriber.
    pub fn publish(&self, data: &[u8]) -> IbResult<()> {
        let inner = &self.inner;
        let timestamp_ns = inner.bus.now_ns();
        if inner.descriptor.history > 0 {
            *inner.cache.lock() = Some((data.to_vec(), timestamp_ns));
        }
        inner.bus.publish(
            &inner.descriptor,
            &inner.sequence,
            Payload::DataMessage(DataMessageEvent {
                data: data.to_vec(),
                labels: inner.descriptor.labels.clone(),
                media_type: inner.descriptor.media_type.clone().unwrap_or_default(),
                timestamp_ns,
            }),
        )
    }
}

impl DataPublisherInner {
    fn matches_subscriber(&self, announcement: &SubscriptionAnnouncement) -> bool {
        announcement.kind == ServiceKind::DataSubscriber
            && announcement.link == self.descriptor.link
            && labels_match(&announcement.labels, &self.descriptor.labels)
    }
}

impl BusController for DataPublisherInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, _envelope: &Envelope) {}

    fn on_remote_endpoint(&self, announcement: &SubscriptionAnnouncement) {
        if self.descriptor.history == 0 || !self.matches_subscriber(announcement) {
            return;
        }
        // Late-join replay: the cached payload goes directly to the new
        // subscriber with its original timestamp.
        let cached = self.cache.lock().clone();
        if let Some((data, timestamp_ns)) = cached {
            let result = self.bus.send_directed(
                &self.descriptor,
                &self.sequence,
                announcement.address,
                Payload::DataMessage(DataMessageEvent {
                    data,
                    labels: self.descriptor.labels.clone(),
                    media_type: self.descriptor.media_type.clone().unwrap_or_default(),
                    timestamp_ns,
                }),
                Some(timestamp_ns),
            );
            if let Err(error) = result {
                tracing::warn!(
                    "history replay to {} failed: {}",
                    announcement.qualified_name,
                    error
                );
            }
        }
    }
}

struct SpecificHandler {
    id: HandlerId,
    labels: Vec<Label>,
    handler: Arc<dyn Fn(&DataMessageEvent) + Send + Sync>,
}

/// A data subscriber endpoint.
#[derive(Clone)]
pub struct DataSubscriber {
    inner: Arc<DataSubscriberInner>,
}

pub(crate) struct DataSubscriberInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    next_specific_id: AtomicU64,
    default_handlers: HandlerRegistry<DataMessageEvent>,
    specific_handlers: Mutex<Vec<SpecificHandler>>,
    new_source_handlers: HandlerRegistry<NewDataSourceEvent>,
    seen_sources: Mutex<HashSet<EndpointAddress>>,
}

impl DataSubscriber {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
    ) -> (Self, Arc<DataSubscriberInner>) {
        let inner = Arc::new(DataSubscriberInner {
            descriptor,
            bus,
            next_specific_id: AtomicU64::new(1_000_000),
            default_handlers: HandlerRegistry::new(),
            specific_handlers: Mutex::new(Vec::new()),
            new_source_handlers: HandlerRegistry::new(),
            seen_sources: Mutex::new(HashSet::new()),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Register the default handler for payloads no specific handler
    /// claims.
    pub fn add_data_message_handler(
        &self,
        handler: impl Fn(&DataMessageEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.default_handlers.add(handler)
    }

    pub fn remove_data_message_handler(&self, id: HandlerId) -> bool {
        self.inner.default_handlers.remove(id)
    }

    /// Register a *specific* handler on a label pattern narrowing the
    /// general subscription. Payloads of publishers that carry every
    /// pattern key (with matching or wildcard values) are routed here
    /// instead of the default handler.
    pub fn add_explicit_data_message_handler(
        &self,
        labels: Vec<Label>,
        handler: impl Fn(&DataMessageEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.inner.next_specific_id.fetch_add(1, Ordering::Relaxed);
        self.inner.specific_handlers.lock().push(SpecificHandler {
            id,
            labels,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn remove_explicit_data_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.specific_handlers.lock();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    /// Register a handler fired once per newly discovered matching
    /// publisher.
    pub fn add_new_data_source_handler(
        &self,
        handler: impl Fn(&NewDataSourceEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.new_source_handlers.add(handler)
    }

    pub fn remove_new_data_source_handler(&self, id: HandlerId) -> bool {
        self.inner.new_source_handlers.remove(id)
    }
}

impl BusController for DataSubscriberInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        let Payload::DataMessage(event) = &envelope.payload else {
            return;
        };
        // The general subscription must match; directed history replay has
        // been filtered by the publisher already but is re-checked cheaply.
        if !labels_match(&self.descriptor.labels, &event.labels) {
            return;
        }
        self.bus
            .trace(&self.descriptor, crate::types::Direction::Rx, envelope);

        let matched: Vec<Arc<dyn Fn(&DataMessageEvent) + Send + Sync>> = self
            .specific_handlers
            .lock()
            .iter()
            .filter(|h| specific_labels_match(&h.labels, &event.labels))
            .map(|h| Arc::clone(&h.handler))
            .collect();

        if matched.is_empty() {
            self.default_handlers.invoke(event);
        } else {
            for handler in matched {
                handler(event);
            }
        }
    }

    fn on_remote_endpoint(&self, announcement: &SubscriptionAnnouncement) {
        if announcement.kind != ServiceKind::DataPublisher
            || announcement.link != self.descriptor.link
            || !labels_match(&self.descriptor.labels, &announcement.labels)
        {
            return;
        }
        let first_sight = self.seen_sources.lock().insert(announcement.address);
        if first_sight {
            self.new_source_handlers.invoke(&NewDataSourceEvent {
                qualified_name: announcement.qualified_name.clone(),
                labels: announcement.labels.clone(),
                media_type: announcement.media_type.clone().unwrap_or_default(),
            });
        }
    }
}
