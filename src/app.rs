//! Assembles the gateway: config in, routed handler out.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::auth::{IdTokenClient, ProviderFactory, provider_factory};
use crate::config::GatewayConfig;
use crate::context::Context;
use crate::middleware::LoggerMiddleware;
use crate::proxy::Forwarder;
use crate::router::Router;
use crate::spa::SpaHost;
use crate::{Request, Response};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to build upstream HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// The routed gateway.
///
/// `{prefix}/*` (any method) goes to the [`Forwarder`]; every other GET or
/// HEAD goes to the [`SpaHost`]. Anything else is 404. All requests pass
/// through [`LoggerMiddleware`].
pub struct App {
    router: Router,
    tokens: Arc<IdTokenClient>,
}

impl App {
    /// Builds the gateway with the token source named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::HttpClient`] if the upstream client cannot be built.
    pub fn new(config: &GatewayConfig) -> Result<Self, AppError> {
        let factory = provider_factory(config.token_source(), config.dns());
        Self::with_provider_factory(config, factory)
    }

    /// Builds the gateway with a caller-supplied provider factory.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::HttpClient`] if the upstream client cannot be built.
    pub fn with_provider_factory(
        config: &GatewayConfig,
        factory: ProviderFactory,
    ) -> Result<Self, AppError> {
        let tokens = Arc::new(IdTokenClient::new(config.token_audience(), factory));
        let forwarder = Arc::new(Forwarder::new(config, Arc::clone(&tokens))?);
        let spa = Arc::new(SpaHost::new(config.static_dir()));

        let mut router = Router::new();
        router.layer(LoggerMiddleware);

        let api = format!("{}/*", forwarder.prefix());
        router.any(&api, move |ctx: Context| {
            let forwarder = Arc::clone(&forwarder);
            async move { forwarder.forward(ctx).await }
        });

        let get = Arc::clone(&spa);
        router.get("/*", move |ctx: Context| {
            let spa = Arc::clone(&get);
            async move { spa.serve(ctx).await }
        });
        router.head("/*", move |ctx: Context| {
            let spa = Arc::clone(&spa);
            async move { spa.serve(ctx).await }
        });

        info!(
            prefix = config.prefix(),
            upstream = config.target_base_url(),
            audience = config.token_audience(),
            static_dir = %config.static_dir().display(),
            dns = %config.dns(),
            "gateway routes configured"
        );

        Ok(Self { router, tokens })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn tokens(&self) -> &IdTokenClient {
        &self.tokens
    }

    pub async fn handle(&self, request: Request) -> Response {
        self.router.route(request).await
    }
}
