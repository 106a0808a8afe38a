//! Message dispatch: handler registration, interceptors, and error translation
//!
//! Handlers register per message tag with a priority; the highest-priority
//! handler receives the message. Interceptors run before dispatch (and may
//! veto) and after (observing the request/response pair). Handler failures
//! are translated into coded Error responses rather than dropped connections.

use crate::protocol::codec::MalformedMessage;
use crate::protocol::{Envelope, ErrorCode, Message};
use crate::resilience::epoch_millis;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Per-connection context threaded through handlers.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub connection_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub protocol: String,
    pub received_at_millis: u64,
    pub attributes: HashMap<String, String>,
}

impl MessageContext {
    pub fn new(
        connection_id: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            remote_addr,
            protocol: protocol.into(),
            received_at_millis: epoch_millis(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A handler failure, translated to a coded Error response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &Envelope,
        ctx: &MessageContext,
    ) -> Result<Option<Message>, HandlerError>;
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Runs before dispatch; an error vetoes processing.
    async fn before(&self, _envelope: &Envelope, _ctx: &MessageContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Observes the request/response pair after dispatch.
    async fn after(
        &self,
        _request: &Envelope,
        _response: Option<&Envelope>,
        _ctx: &MessageContext,
    ) {
    }
}

/// Role required by a protected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
    Peer,
    Guest,
}

/// Authorization boundary hook. Handlers that protect an operation consult
/// this with the token from the message context.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>, required: Role) -> Result<(), HandlerError>;
}

/// Default authorizer: everything is permitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _token: Option<&str>, _required: Role) -> Result<(), HandlerError> {
        Ok(())
    }
}

type HandlerList = Vec<(i32, Arc<dyn MessageHandler>)>;

pub struct Dispatcher {
    node_id: String,
    handlers: RwLock<HashMap<String, HandlerList>>,
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl Dispatcher {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            handlers: RwLock::new(HashMap::new()),
            interceptors: RwLock::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register `handler` for a message tag. Higher priority wins; ties keep
    /// registration order.
    pub fn register_handler(
        &self,
        kind: &str,
        priority: i32,
        handler: Arc<dyn MessageHandler>,
    ) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        let list = handlers.entry(kind.to_string()).or_default();
        list.push((priority, handler));
        list.sort_by(|a, b| b.0.cmp(&a.0));
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.write().unwrap_or_else(|p| p.into_inner()).push(interceptor);
    }

    /// Dispatch one envelope; returns the response to write, if any.
    pub async fn dispatch(&self, envelope: Envelope, ctx: &MessageContext) -> Option<Envelope> {
        if let Err(e) = envelope.validate() {
            return Some(Envelope::error_for(
                &envelope,
                &self.node_id,
                ErrorCode::InvalidMessage,
                e.to_string(),
            ));
        }

        let interceptors: Vec<_> = {
            self.interceptors.read().unwrap_or_else(|p| p.into_inner()).clone()
        };
        for interceptor in &interceptors {
            if let Err(veto) = interceptor.before(&envelope, ctx).await {
                tracing::debug!(code = %veto.code, "interceptor vetoed message");
                let response =
                    Envelope::error_for(&envelope, &self.node_id, veto.code, veto.message);
                for interceptor in &interceptors {
                    interceptor.after(&envelope, Some(&response), ctx).await;
                }
                return Some(response);
            }
        }

        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            handlers
                .get(envelope.message.kind())
                .and_then(|list| list.first())
                .map(|(_, handler)| handler.clone())
        };

        let response = match handler {
            None => Some(Envelope::error_for(
                &envelope,
                &self.node_id,
                ErrorCode::UnknownCommand,
                format!("no handler for '{}'", envelope.message.kind()),
            )),
            Some(handler) => match handler.handle(&envelope, ctx).await {
                Ok(Some(message)) => Some(Envelope::respond_to(&envelope, &self.node_id, message)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(
                        kind = envelope.message.kind(),
                        code = %e.code,
                        error = %e.message,
                        "handler failed"
                    );
                    Some(Envelope::error_for(&envelope, &self.node_id, e.code, e.message))
                }
            },
        };

        for interceptor in &interceptors {
            interceptor.after(&envelope, response.as_ref(), ctx).await;
        }
        response
    }

    /// Build the error response for a line that never became an envelope.
    pub fn respond_malformed(&self, malformed: &MalformedMessage) -> Envelope {
        Envelope::error_raw(
            &self.node_id,
            malformed.sender_id.clone().unwrap_or_else(|| "unknown".to_string()),
            malformed.original_message_id.clone(),
            malformed.code,
            malformed.detail.clone(),
        )
    }
}
