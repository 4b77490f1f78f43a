//! Identity tokens for the upstream API.
//!
//! [`TokenProvider`] is the seam: anything that can hand out a bearer token for
//! one audience. [`IdTokenClient`] owns the audience and builds its provider
//! lazily, exactly once, the first time a forwarded request needs a token.
//! Whether a provider reuses or refreshes its credential is its own business.

mod metadata;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::TokenSource;
use crate::dns::DnsStrategy;

pub use metadata::MetadataTokenProvider;

/// Timeout for a single metadata-server round trip.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to build identity token client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("identity token request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("metadata server returned {status}: {body}")]
    Metadata { status: u16, body: String },

    #[error("identity token provider returned an empty token")]
    EmptyToken,
}

/// A boxed, `Send` token future.
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<String, TokenError>> + Send + 'a>>;

/// Source of bearer tokens for a single audience.
///
/// Implementations must be safe to call from many requests at once.
pub trait TokenProvider: Send + Sync {
    fn fetch_id_token(&self) -> TokenFuture<'_>;
}

/// Returns a fixed token. Useful outside Google Cloud and in tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn fetch_id_token(&self) -> TokenFuture<'_> {
        Box::pin(async move { Ok(self.token.clone()) })
    }
}

/// Builds the provider for an audience.
pub type ProviderFactory =
    Box<dyn Fn(&str) -> Result<Arc<dyn TokenProvider>, TokenError> + Send + Sync>;

/// Returns the factory for a configured [`TokenSource`].
///
/// Metadata providers get their own HTTP client with `dns` applied, so a
/// pinned metadata address works the same way as a pinned API address.
pub fn provider_factory(source: &TokenSource, dns: &DnsStrategy) -> ProviderFactory {
    match source {
        TokenSource::Metadata { host } => {
            let host = host.clone();
            let dns = dns.clone();
            Box::new(move |audience: &str| {
                let http = dns
                    .apply(reqwest::Client::builder().timeout(METADATA_TIMEOUT))
                    .build()
                    .map_err(TokenError::Client)?;
                let provider: Arc<dyn TokenProvider> =
                    Arc::new(MetadataTokenProvider::new(http, &host, audience));
                Ok(provider)
            })
        }
        TokenSource::Static { token } => {
            let token = token.clone();
            Box::new(move |_audience: &str| {
                let provider: Arc<dyn TokenProvider> =
                    Arc::new(StaticTokenProvider::new(token.clone()));
                Ok(provider)
            })
        }
    }
}

/// Process-wide handle that yields bearer tokens for one audience.
///
/// The provider is created on first use behind an async once-cell: concurrent
/// first requests wait for a single construction, later requests never lock.
/// A failed construction is not remembered, so the next request tries again.
pub struct IdTokenClient {
    audience: String,
    factory: ProviderFactory,
    provider: OnceCell<Arc<dyn TokenProvider>>,
}

impl IdTokenClient {
    pub fn new(audience: impl Into<String>, factory: ProviderFactory) -> Self {
        Self {
            audience: audience.into(),
            factory,
            provider: OnceCell::new(),
        }
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Returns `true` once the provider has been constructed.
    pub fn is_initialized(&self) -> bool {
        self.provider.initialized()
    }

    /// Returns a non-empty bearer token.
    ///
    /// # Errors
    ///
    /// Propagates provider construction and fetch failures, and returns
    /// [`TokenError::EmptyToken`] for a blank token.
    pub async fn bearer_token(&self) -> Result<String, TokenError> {
        let provider = self
            .provider
            .get_or_try_init(|| async {
                info!(audience = %self.audience, "initializing identity token provider");
                (self.factory)(&self.audience)
            })
            .await?;

        let token = provider.fetch_id_token().await?;
        if token.trim().is_empty() {
            return Err(TokenError::EmptyToken);
        }
        debug!(audience = %self.audience, "identity token acquired");
        Ok(token)
    }
}

impl fmt::Debug for IdTokenClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdTokenClient")
            .field("audience", &self.audience)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
