use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::{TokenError, TokenFuture, TokenProvider};

const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";

/// Tokens are refreshed this long before their `exp`.
const REFRESH_SKEW: Duration = Duration::from_secs(300);

/// Longest metadata error body echoed into a [`TokenError`].
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Fetches Google-signed ID tokens from the GCE / Cloud Run metadata server.
///
/// A token is reused until [`REFRESH_SKEW`] before the `exp` in its JWT
/// payload. Tokens whose payload cannot be read are never cached.
pub struct MetadataTokenProvider {
    http: reqwest::Client,
    identity_url: String,
    audience: String,
    cached: RwLock<Option<CachedToken>>,
}

impl MetadataTokenProvider {
    /// `metadata_host` is `host[:port]`, normally `metadata.google.internal`.
    pub fn new(http: reqwest::Client, metadata_host: &str, audience: impl Into<String>) -> Self {
        Self {
            http,
            identity_url: format!("http://{metadata_host}{IDENTITY_PATH}"),
            audience: audience.into(),
            cached: RwLock::new(None),
        }
    }

    async fn request_token(&self) -> Result<String, TokenError> {
        let response = self
            .http
            .get(&self.identity_url)
            .query(&[("audience", self.audience.as_str()), ("format", "full")])
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(TokenError::Request)?;

        let status = response.status();
        let body = response.text().await.map_err(TokenError::Request)?;
        if !status.is_success() {
            let mut body = body.trim().to_owned();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|&i| body.is_char_boundary(i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(TokenError::Metadata {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body.trim().to_owned())
    }

    async fn token(&self) -> Result<String, TokenError> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }

        // No lock is held during the round trip; concurrent misses fetch in
        // parallel and the last one to finish is kept.
        let token = self.request_token().await?;
        let fresh = refresh_deadline(&token).map(|refresh_at| CachedToken {
            token: token.clone(),
            refresh_at,
        });
        let cached = fresh.is_some();
        *self.cached.write().await = fresh;
        debug!(audience = %self.audience, cached, "fetched identity token from metadata server");
        Ok(token)
    }
}

impl TokenProvider for MetadataTokenProvider {
    fn fetch_id_token(&self) -> TokenFuture<'_> {
        Box::pin(self.token())
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: u64,
}

/// Reads `exp` (seconds since the epoch) from an unverified JWT payload.
fn jwt_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<Claims>(&bytes).ok().map(|c| c.exp)
}

fn refresh_deadline(token: &str) -> Option<Instant> {
    let exp = jwt_expiry(token)?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    let remaining = Duration::from_secs(exp.checked_sub(now)?);
    let usable = remaining.checked_sub(REFRESH_SKEW)?;
    Some(Instant::now() + usable)
}
