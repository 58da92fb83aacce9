//! # RPC Service
//!
//! Call/response correlation over the data-routing substrate. A client's
//! `call` allocates a unique call handle and sends the argument bytes
//! directly to every matching server; each server's handler produces a
//! result that is routed back by handle. Per-call status is `Success` on a
//! delivered result, `Timeout` when the optional per-client timeout
//! elapses first, and `Undeliverable` when no server matches at call time.

use crate::error::IbResult;
use crate::participant::BusHandle;
use crate::services::{BusController, EndpointDescriptor, HandlerId, HandlerRegistry};
use crate::types::{Label, NanosecondsTime};
use crate::wire::{Envelope, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of one outstanding call.
pub type CallHandle = Uuid;

/// Delivery status of a call, as seen by the client's result handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// A server delivered a result
    Success,
    /// The per-client timeout elapsed before all results arrived
    Timeout,
    /// No server matched at call time
    Undeliverable,
}

/// Wire message: argument bytes to one matching server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCallMessage {
    pub call_handle: CallHandle,
    pub data: Vec<u8>,
}

/// Wire message: a server's result, routed back by handle. Also
/// synthesized locally for `Timeout` and `Undeliverable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResultMessage {
    pub call_handle: CallHandle,
    pub status: CallStatus,
    pub data: Vec<u8>,
}

/// Delivered to a server's call handler.
#[derive(Debug, Clone)]
pub struct RpcCallEvent {
    pub call_handle: CallHandle,
    pub data: Vec<u8>,
    pub timestamp_ns: NanosecondsTime,
}

/// Delivered to a client's result handler.
#[derive(Debug, Clone)]
pub struct RpcCallResultEvent {
    pub call_handle: CallHandle,
    pub status: CallStatus,
    pub return_data: Vec<u8>,
    pub timestamp_ns: NanosecondsTime,
}

/// A currently known matching server, as reported by `discover_servers`.
#[derive(Debug, Clone)]
pub struct RpcServerInfo {
    pub qualified_name: String,
    pub labels: Vec<Label>,
}

/// An RPC client endpoint.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<RpcClientInner>,
}

pub(crate) struct RpcClientInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    sequence: AtomicU64,
    call_timeout: Option<Duration>,
    result_handlers: HandlerRegistry<RpcCallResultEvent>,
    /// Outstanding results per call handle
    pending: Mutex<HashMap<CallHandle, usize>>,
}

impl RpcClient {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
        call_timeout: Option<Duration>,
    ) -> (Self, Arc<RpcClientInner>) {
        let inner = Arc::new(RpcClientInner {
            descriptor,
            bus,
            sequence: AtomicU64::new(0),
            call_timeout,
            result_handlers: HandlerRegistry::new(),
            pending: Mutex::new(HashMap::new()),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Place a call with the given argument bytes.
    ///
    /// The argument is fanned out to every matching server; each server
    /// contributes one result event. With no matching server the result
    /// handler observes a single `Undeliverable` event for the handle.
    pub fn call(&self, data: Vec<u8>) -> IbResult<CallHandle> {
        let inner = &self.inner;
        let handle = Uuid::new_v4();

        let servers = inner.bus.router().matching_rpc_servers(
            &inner.descriptor.link,
            &inner.descriptor.labels,
            inner.descriptor.address,
        );

        if servers.is_empty() {
            inner.bus.send_directed(
                &inner.descriptor,
                &inner.sequence,
                inner.descriptor.address,
                Payload::RpcResult(RpcResultMessage {
                    call_handle: handle,
                    status: CallStatus::Undeliverable,
                    data: Vec::new(),
                }),
                None,
            )?;
            return Ok(handle);
        }

        inner.pending.lock().insert(handle, servers.len());
        for server in &servers {
            inner.bus.send_directed(
                &inner.descriptor,
                &inner.sequence,
                server.address,
                Payload::RpcCall(RpcCallMessage {
                    call_handle: handle,
                    data: data.clone(),
                }),
                None,
            )?;
        }

        if let Some(timeout) = inner.call_timeout {
            // The timeout event travels through the same dispatch queue as
            // real results; whichever arrives first settles the call.
            inner.bus.loopback_later(
                timeout,
                &inner.descriptor,
                &inner.sequence,
                Payload::RpcResult(RpcResultMessage {
                    call_handle: handle,
                    status: CallStatus::Timeout,
                    data: Vec::new(),
                }),
            );
        }
        Ok(handle)
    }

    /// The currently known matching server set, without placing a call.
    pub fn discover_servers(&self) -> Vec<RpcServerInfo> {
        self.inner
            .bus
            .router()
            .matching_rpc_servers(
                &self.inner.descriptor.link,
                &self.inner.descriptor.labels,
                self.inner.descriptor.address,
            )
            .into_iter()
            .map(|server| RpcServerInfo {
                qualified_name: server.qualified_name,
                labels: server.labels,
            })
            .collect()
    }

    pub fn add_call_result_handler(
        &self,
        handler: impl Fn(&RpcCallResultEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.result_handlers.add(handler)
    }

    pub fn remove_call_result_handler(&self, id: HandlerId) -> bool {
        self.inner.result_handlers.remove(id)
    }
}

impl BusController for RpcClientInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        let Payload::RpcResult(result) = &envelope.payload else {
            return;
        };

        match result.status {
            CallStatus::Success => {
                let mut pending = self.pending.lock();
                match pending.get_mut(&result.call_handle) {
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining == 0 {
                            pending.remove(&result.call_handle);
                        }
                    }
                    // Late result after a timeout already settled the call
                    None => return,
                }
            }
            CallStatus::Timeout => {
                // Only meaningful while results are still outstanding.
                if self.pending.lock().remove(&result.call_handle).is_none() {
                    return;
                }
            }
            CallStatus::Undeliverable => {}
        }

        self.result_handlers.invoke(&RpcCallResultEvent {
            call_handle: result.call_handle,
            status: result.status,
            return_data: result.data.clone(),
            timestamp_ns: envelope.timestamp_ns,
        });
    }
}

type CallHandler = Arc<dyn Fn(&RpcCallEvent) -> Vec<u8> + Send + Sync>;

/// An RPC server endpoint.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<RpcServerInner>,
}

pub(crate) struct RpcServerInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    sequence: AtomicU64,
    handler: Mutex<Option<CallHandler>>,
}

impl RpcServer {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
    ) -> (Self, Arc<RpcServerInner>) {
        let inner = Arc::new(RpcServerInner {
            descriptor,
            bus,
            sequence: AtomicU64::new(0),
            handler: Mutex::new(None),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Install the call handler. The returned bytes are routed back to the
    /// calling client as the result.
    pub fn set_call_handler(
        &self,
        handler: impl Fn(&RpcCallEvent) -> Vec<u8> + Send + Sync + 'static,
    ) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }
}

impl RpcServerInner {
    fn submit_result(&self, call: &RpcCallMessage, caller: crate::types::EndpointAddress) {
        let handler = self.handler.lock().clone();
        let Some(handler) = handler else {
            tracing::warn!(
                "RPC server {} received a call without a handler",
                self.descriptor.qualified_name
            );
            return;
        };
        let result = handler(&RpcCallEvent {
            call_handle: call.call_handle,
            data: call.data.clone(),
            timestamp_ns: self.bus.now_ns(),
        });
        let send_result = self.bus.send_directed(
            &self.descriptor,
            &self.sequence,
            caller,
            Payload::RpcResult(RpcResultMessage {
                call_handle: call.call_handle,
                status: CallStatus::Success,
                data: result,
            }),
            None,
        );
        if let Err(error) = send_result {
            tracing::warn!(
                "RPC server {} failed to route result: {}",
                self.descriptor.qualified_name,
                error
            );
        }
    }
}

impl BusController for RpcServerInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        if let Payload::RpcCall(call) = &envelope.payload {
            self.submit_result(call, envelope.sender);
        }
    }
}
