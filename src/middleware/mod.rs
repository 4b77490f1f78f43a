//! Middleware pipeline: composable logic that runs around every routed request.
//!
//! - [`Middleware`] is the trait every layer implements.
//! - [`Next`] is the cursor into the rest of the chain; the chain ends at the
//!   handler chosen by the router.
//! - [`LoggerMiddleware`] logs one line per request.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context, router::Handler};

/// A boxed, `Send` response future.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`Next::run`], so each layer can call it at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Which middleware `run` invokes next; past the end means the endpoint.
    index: usize,
    endpoint: Handler,
}

impl Next {
    /// Creates a cursor at the start of `middlewares`, ending at `endpoint`.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>, endpoint: Handler) -> Self {
        Self {
            middlewares,
            index: 0,
            endpoint,
        }
    }

    /// Invokes the next middleware, or the endpoint once the chain is exhausted.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => (self.endpoint)(ctx).await,
        }
    }
}

/// The trait for all middleware.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit by
/// returning a response without calling `next`, or decorate the downstream
/// response.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// Logs each request's method, path, status, and duration.
///
/// Runs for every request the router sees, including unmatched ones.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            let status = response.status().as_u16();
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            if response.status().is_server_error() {
                tracing::warn!(%method, %path, status, elapsed_ms, "request failed");
            } else {
                tracing::info!(%method, %path, status, elapsed_ms, "request served");
            }

            response
        })
    }
}
