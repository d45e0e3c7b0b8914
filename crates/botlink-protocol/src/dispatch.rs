/// Operation dispatch: maps an inbound call's declared operation name
/// to a registered handler, after running the middleware pipeline.
use std::collections::HashMap;
use std::sync::Arc;

use crate::envelope::Body;
use crate::error::ProtocolError;
use crate::types::PeerId;

/// Which transport channel a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Socket,
    Rest,
}

/// Per-call context handed to middleware and handlers.
///
/// `extras` is an open record: middleware may attach whatever the
/// handlers downstream need (authenticated user, trace ids, ...).
#[derive(Debug, Clone)]
pub struct Context {
    pub channel: ChannelKind,
    pub peer: PeerId,
    pub operation: String,
    pub body: Body,
    /// Whether the call arrived over an authenticated encrypted channel.
    pub secure: bool,
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl Context {
    pub fn new(peer: PeerId, operation: impl Into<String>, body: Body, secure: bool) -> Self {
        Self {
            channel: ChannelKind::Socket,
            peer,
            operation: operation.into(),
            body,
            secure,
            extras: serde_json::Map::new(),
        }
    }
}

/// An ordered transform over the call context. Applied in registration
/// order; the first failure short-circuits dispatch.
pub type Middleware = Arc<dyn Fn(Context) -> Result<Context, ProtocolError> + Send + Sync>;

/// A registered operation.
#[async_trait::async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, ctx: &Context) -> Result<Body, ProtocolError>;
}

/// Adapter for plain synchronous handler functions.
pub struct SyncHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> OperationHandler for SyncHandler<F>
where
    F: Fn(&Context) -> Result<Body, ProtocolError> + Send + Sync,
{
    async fn handle(&self, ctx: &Context) -> Result<Body, ProtocolError> {
        (self.0)(ctx)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
    middleware: Vec<Middleware>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under an operation name. Replaces any prior
    /// registration for that name.
    pub fn register(&mut self, operation: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(operation.into(), handler);
    }

    /// Append a middleware transform to the pipeline.
    pub fn use_middleware(&mut self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    pub fn has_operation(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Run the middleware pipeline, then the matching handler.
    pub async fn dispatch(&self, ctx: Context) -> Result<Body, ProtocolError> {
        let mut ctx = ctx;
        for transform in &self.middleware {
            ctx = transform(ctx)?;
        }

        let handler = self
            .handlers
            .get(&ctx.operation)
            .ok_or_else(|| ProtocolError::UnknownOperation(ctx.operation.clone()))?;
        handler.handle(&ctx).await
    }
}
