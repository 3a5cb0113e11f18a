//! An explicit, ordered middleware pipeline around message handling.
//!
//! Cross-cutting concerns (logging, timing, transactions) are composed at
//! startup as a flat list rather than nested decorators, so ordering is
//! auditable and each layer is testable in isolation.

use crate::envelope::Envelope;
use async_trait::async_trait;
use log::{debug, error};
use std::sync::Arc;

/// Error type flowing out of handlers and middleware.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Terminal consumer of an envelope, invoked after every middleware layer
/// has passed the message along.
#[async_trait]
pub trait Handler<M>: Send + Sync {
    /// Processes the message.
    async fn call(&self, envelope: &Envelope<M>) -> Result<(), HandlerError>;
}

/// One layer of the pipeline.
///
/// A middleware may inspect the envelope, run work before and after the rest
/// of the chain, or short-circuit by not invoking `next` at all.
#[async_trait]
pub trait Middleware<M>: Send + Sync {
    /// Handles the envelope, usually delegating to `next.run(envelope)`.
    async fn handle(&self, envelope: &Envelope<M>, next: Next<'_, M>) -> Result<(), HandlerError>;
}

/// The remainder of the chain from a middleware's point of view.
pub struct Next<'a, M> {
    middleware: &'a [Arc<dyn Middleware<M>>],
    handler: &'a dyn Handler<M>,
}

impl<'a, M: Send + Sync> Next<'a, M> {
    /// Passes the envelope to the next layer, or to the terminal handler
    /// when no layers remain.
    pub async fn run(self, envelope: &Envelope<M>) -> Result<(), HandlerError> {
        match self.middleware.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    middleware: rest,
                    handler: self.handler,
                };
                first.handle(envelope, next).await
            }
            None => self.handler.call(envelope).await,
        }
    }
}

/// An ordered middleware chain, composed once at startup.
pub struct Pipeline<M> {
    middleware: Vec<Arc<dyn Middleware<M>>>,
}

impl<M: Send + Sync> Pipeline<M> {
    /// Creates an empty pipeline that passes envelopes straight through.
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// Appends a layer. Layers run in insertion order, outermost first.
    pub fn with(mut self, middleware: Arc<dyn Middleware<M>>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Runs the envelope through every layer and into the handler.
    pub async fn dispatch(
        &self,
        envelope: &Envelope<M>,
        handler: &dyn Handler<M>,
    ) -> Result<(), HandlerError> {
        Next {
            middleware: &self.middleware,
            handler,
        }
        .run(envelope)
        .await
    }
}

impl<M: Send + Sync> Default for Pipeline<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs each message as it enters the chain and any error on the way out.
pub struct LoggingMiddleware;

#[async_trait]
impl<M: Send + Sync> Middleware<M> for LoggingMiddleware {
    async fn handle(&self, envelope: &Envelope<M>, next: Next<'_, M>) -> Result<(), HandlerError> {
        let id = envelope
            .property(crate::envelope::keys::MESSAGE_ID)
            .unwrap_or("<unset>");
        debug!("handling message {}", id);
        let result = next.run(envelope).await;
        if let Err(e) = &result {
            error!("message {} failed: {}", id, e);
        }
        result
    }
}
