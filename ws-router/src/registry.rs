//! Message descriptor registry (spec §4.1). Effectively immutable after
//! router start; `lookup` is lock-free once constructed.

use std::sync::Arc;

use dashmap::DashMap;

use crate::envelope::is_control_type;
use crate::error::{WsRouterError, WsRouterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Event,
    Rpc,
}

/// `S` is the validator's schema representation. The registry never
/// interprets it — only the `ValidatorAdapter` does.
#[derive(Debug)]
pub struct MessageDescriptor<S> {
    pub message_type: String,
    pub kind: MessageKind,
    pub request_schema: S,
    /// Present iff `kind == Rpc`.
    pub response_schema: Option<S>,
    /// The wire `type` of the RPC's success response, when this is an RPC
    /// descriptor. `None` for events.
    pub response_message_type: Option<String>,
}

impl<S> MessageDescriptor<S> {
    pub fn event(message_type: impl Into<String>, request_schema: S) -> Self {
        Self {
            message_type: message_type.into(),
            kind: MessageKind::Event,
            request_schema,
            response_schema: None,
            response_message_type: None,
        }
    }

    pub fn rpc(
        message_type: impl Into<String>,
        request_schema: S,
        response_message_type: impl Into<String>,
        response_schema: S,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            kind: MessageKind::Rpc,
            request_schema,
            response_schema: Some(response_schema),
            response_message_type: Some(response_message_type.into()),
        }
    }

    pub fn is_rpc(&self) -> bool {
        self.kind == MessageKind::Rpc
    }
}

/// Holds `{ messageType -> descriptor }`. See spec §4.1.
pub struct MessageRegistry<S> {
    descriptors: DashMap<String, Arc<MessageDescriptor<S>>>,
    /// response message type -> request message type, so a colliding
    /// `responseSchema.messageType` can be detected at registration time.
    response_types: DashMap<String, String>,
}

impl<S> Default for MessageRegistry<S> {
    fn default() -> Self {
        Self {
            descriptors: DashMap::new(),
            response_types: DashMap::new(),
        }
    }
}

impl<S> MessageRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: MessageDescriptor<S>) -> WsRouterResult<()> {
        if is_control_type(&descriptor.message_type) {
            return Err(WsRouterError::InvalidArgument(
                format!("RESERVED_TYPE: {}", descriptor.message_type).into(),
            ));
        }

        if self.descriptors.contains_key(&descriptor.message_type) {
            return Err(WsRouterError::AlreadyExists(
                format!("DUPLICATE_TYPE: {}", descriptor.message_type).into(),
            ));
        }

        if let Some(response_type) = &descriptor.response_message_type {
            if let Some(existing) = self.response_types.get(response_type) {
                return Err(WsRouterError::AlreadyExists(
                    format!(
                        "DUPLICATE_TYPE: response type {} already bound to {}",
                        response_type,
                        existing.value()
                    )
                    .into(),
                ));
            }
        }

        if let Some(response_type) = descriptor.response_message_type.clone() {
            self.response_types
                .insert(response_type, descriptor.message_type.clone());
        }

        self.descriptors
            .insert(descriptor.message_type.clone(), Arc::new(descriptor));

        Ok(())
    }

    pub fn lookup(&self, message_type: &str) -> Option<Arc<MessageDescriptor<S>>> {
        self.descriptors.get(message_type).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
