//! Message router: dispatches inbound envelopes to the handler registered
//! for their kind.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::handlers::HandlerContext;
use crate::message::{Envelope, MessageKind};

/// An admitted inbound envelope.
#[derive(Debug, Clone)]
pub struct Received {
    pub envelope: Envelope,
    /// Source host on the local link; `None` for broker traffic.
    pub origin_host: Option<SocketAddr>,
}

/// A reply a handler wants sent on the active link.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub envelope: Envelope,
    /// Device ids to address; empty means everyone.
    pub recipients: Vec<String>,
}

pub type HandlerResult = Result<Option<Outbound>, NetworkError>;

/// A handler processes one envelope and optionally returns a reply.
/// Handlers run synchronously inside the inbound pass.
pub type MessageHandler = Arc<dyn Fn(&HandlerContext, &Received) -> HandlerResult + Send + Sync>;

/// Kind-indexed handler registry.
pub struct MessageRouter {
    handlers: HashMap<MessageKind, MessageHandler>,
    default_handler: Option<MessageHandler>,
}

impl MessageRouter {
    /// Create a new router with no handlers registered.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: None,
        }
    }

    /// Register a handler for a specific message kind, replacing any
    /// existing one.
    pub fn register(&mut self, kind: MessageKind, handler: MessageHandler) {
        debug!("Registering handler for message kind: {kind}");
        self.handlers.insert(kind, handler);
    }

    /// Register a default handler for unmatched message kinds.
    pub fn set_default_handler(&mut self, handler: MessageHandler) {
        self.default_handler = Some(handler);
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Look up the handler for `kind`, falling back to the default.
    pub fn handler_for(&self, kind: MessageKind) -> Option<MessageHandler> {
        self.handlers
            .get(&kind)
            .or(self.default_handler.as_ref())
            .cloned()
    }

    /// Dispatch an envelope to its handler.
    pub fn dispatch(&self, ctx: &HandlerContext, received: &Received) -> HandlerResult {
        let kind = received.envelope.kind;
        match self.handler_for(kind) {
            Some(handler) => {
                debug!(
                    "Dispatching {kind} from {}",
                    received.envelope.origin_device_id
                );
                handler(ctx, received)
            }
            None => {
                warn!("No handler for message kind: {kind}");
                Ok(None)
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_context;
    use serde_json::Map;

    fn received(kind: MessageKind) -> Received {
        Received {
            envelope: Envelope::new(kind, "dev-b", Map::new()),
            origin_host: None,
        }
    }

    fn echo(kind: MessageKind) -> MessageHandler {
        Arc::new(move |_ctx: &HandlerContext, r: &Received| -> HandlerResult {
            Ok(Some(Outbound {
                envelope: Envelope::new(kind, "dev-a", r.envelope.payload.clone()),
                recipients: vec![r.envelope.origin_device_id.clone()],
            }))
        })
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let ctx = test_context("dev-a");
        let mut router = MessageRouter::new();
        router.register(MessageKind::DiscoveryHello, echo(MessageKind::Profile));
        assert!(router.has_handler(MessageKind::DiscoveryHello));
        assert_eq!(router.handler_count(), 1);

        let reply = router
            .dispatch(&ctx, &received(MessageKind::DiscoveryHello))
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.kind, MessageKind::Profile);
        assert_eq!(reply.recipients, vec!["dev-b".to_string()]);
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let ctx = test_context("dev-a");
        let mut router = MessageRouter::new();
        router.register(MessageKind::Chat, echo(MessageKind::Chat));
        router.register(
            MessageKind::Chat,
            Arc::new(|_: &HandlerContext, _: &Received| -> HandlerResult { Ok(None) }),
        );
        assert_eq!(router.handler_count(), 1);
        assert!(router.dispatch(&ctx, &received(MessageKind::Chat)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unhandled_message() {
        let ctx = test_context("dev-a");
        let router = MessageRouter::new();
        assert!(router.dispatch(&ctx, &received(MessageKind::Photo)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_handler() {
        let ctx = test_context("dev-a");
        let mut router = MessageRouter::new();
        router.set_default_handler(echo(MessageKind::Position));

        let reply = router
            .dispatch(&ctx, &received(MessageKind::Photo))
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.kind, MessageKind::Position);
    }
}
