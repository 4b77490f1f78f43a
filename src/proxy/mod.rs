//! Authenticated forwarding of `{prefix}/*` to the internal API.
//!
//! A forwarded request keeps its method, the path with the prefix removed once,
//! and its query string. Of the caller's headers only `Content-Type` survives;
//! `Authorization: Bearer <token>` is always added. Bodies of non-GET/HEAD
//! requests are re-serialized as JSON. The upstream status, `Content-Type` and
//! raw body bytes are relayed unchanged.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::{IdTokenClient, TokenError};
use crate::config::GatewayConfig;
use crate::context::Context;
use crate::{Response, StatusCode};

const AUTH_FAILURE: &str = "Failed to authenticate proxy request";
const UPSTREAM_FAILURE: &str = "Proxy encountered an error.";
const UPSTREAM_TIMEOUT: &str = "Upstream request timed out.";
const INVALID_BODY: &str = "Invalid JSON body";

/// Why a request could not be relayed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid JSON body: {0}")]
    InvalidBody(#[source] serde_json::Error),

    #[error("method `{0}` cannot be forwarded")]
    InvalidMethod(String),

    #[error("identity token unavailable: {0}")]
    Token(#[from] TokenError),

    #[error("upstream request failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to read upstream response: {0}")]
    ReadBody(#[source] reqwest::Error),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) | Self::InvalidMethod(_) => StatusCode::BAD_REQUEST,
            Self::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Connect(_) | Self::ReadBody(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Converts the error into the response the caller sees.
    ///
    /// Auth and body-parse failures carry the underlying error text only when
    /// `expose_details` is set. Upstream failures never carry detail.
    pub fn into_response(self, expose_details: bool) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "forwarding failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "rejected forwarded request");
        }

        let body = match &self {
            Self::InvalidBody(e) if expose_details => format!("{INVALID_BODY}: {e}"),
            Self::InvalidBody(_) => INVALID_BODY.to_owned(),
            Self::InvalidMethod(_) => self.to_string(),
            Self::Token(e) if expose_details => format!("{AUTH_FAILURE}: {e}"),
            Self::Token(_) => AUTH_FAILURE.to_owned(),
            Self::Connect(_) | Self::ReadBody(_) => UPSTREAM_FAILURE.to_owned(),
            Self::Timeout(_) => UPSTREAM_TIMEOUT.to_owned(),
        };
        Response::new(status).body(body)
    }
}

/// Strips `prefix` from `path` exactly once.
///
/// Returns `None` when `path` is not under `prefix` on a segment boundary.
/// The prefix alone maps to `/`.
///
/// ```
/// use dashgate::proxy::rewrite_path;
///
/// assert_eq!(rewrite_path("/api", "/api/ping-db"), Some("/ping-db"));
/// assert_eq!(rewrite_path("/api", "/api/api/x"), Some("/api/x"));
/// assert_eq!(rewrite_path("/api", "/api"), Some("/"));
/// assert_eq!(rewrite_path("/api", "/apifoo"), None);
/// ```
pub fn rewrite_path<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    match path.strip_prefix(prefix)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

/// Relays requests under the configured prefix to the internal API.
pub struct Forwarder {
    http: reqwest::Client,
    target_base_url: String,
    prefix: String,
    timeout: Duration,
    tokens: Arc<IdTokenClient>,
    expose_error_details: bool,
}

impl Forwarder {
    /// Builds the upstream HTTP client from `config`.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the TLS backend cannot be initialized.
    pub fn new(config: &GatewayConfig, tokens: Arc<IdTokenClient>) -> Result<Self, reqwest::Error> {
        let http = config
            .dns()
            .apply(reqwest::Client::builder().timeout(config.upstream_timeout()))
            .build()?;

        Ok(Self {
            http,
            target_base_url: config.target_base_url().to_owned(),
            prefix: config.prefix().to_owned(),
            timeout: config.upstream_timeout(),
            tokens,
            expose_error_details: config.expose_error_details(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Upstream URL for an inbound path and query, or `None` outside the prefix.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Option<String> {
        let rest = rewrite_path(&self.prefix, path)?;
        Some(self.join(rest, query))
    }

    fn join(&self, rest: &str, query: Option<&str>) -> String {
        match query {
            Some(q) => format!("{}{rest}?{q}", self.target_base_url),
            None => format!("{}{rest}", self.target_base_url),
        }
    }

    /// Forwards the request and relays the upstream response.
    ///
    /// Every failure is turned into a response here; nothing propagates.
    pub async fn forward(&self, ctx: Context) -> Response {
        match self.try_forward(&ctx).await {
            Ok(response) => response,
            Err(e) => e.into_response(self.expose_error_details),
        }
    }

    async fn try_forward(&self, ctx: &Context) -> Result<Response, ForwardError> {
        let request = ctx.request();
        // The router already split off the prefix for `{prefix}/*` routes.
        let rest = match ctx.params().wildcard() {
            Some("") => Some("/"),
            Some(rest) => Some(rest),
            None => rewrite_path(&self.prefix, request.path()),
        };
        let Some(rest) = rest else {
            return Ok(Response::new(StatusCode::NOT_FOUND).body("Not Found"));
        };
        let url = self.join(rest, request.query_string());

        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|_| ForwardError::InvalidMethod(request.method().to_string()))?;

        // Parsed before the token so a bad body never costs a metadata round trip.
        let body = if request.method().may_carry_body() && !request.body().is_empty() {
            let value: serde_json::Value = ctx.json().map_err(ForwardError::InvalidBody)?;
            Some(serde_json::to_vec(&value).map_err(ForwardError::InvalidBody)?)
        } else {
            None
        };

        let token = self.tokens.bearer_token().await?;

        let mut outbound = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, format!("Bearer {token}"));
        if let Some(content_type) = request.headers().get("content-type") {
            outbound = outbound.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = body {
            outbound = outbound.body(body);
        }

        let upstream = outbound.send().await.map_err(|e| self.classify(e, false))?;
        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = upstream
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = upstream.bytes().await.map_err(|e| self.classify(e, true))?;

        debug!(
            method = %request.method(),
            upstream = %url,
            status = status.as_u16(),
            bytes = bytes.len(),
            "forwarded authenticated request"
        );

        let mut response = Response::new(status).body_bytes(bytes);
        if let Some(content_type) = content_type {
            response.add_header("Content-Type", content_type);
        }
        Ok(response)
    }

    fn classify(&self, e: reqwest::Error, reading_body: bool) -> ForwardError {
        if e.is_timeout() {
            ForwardError::Timeout(self.timeout)
        } else if reading_body {
            ForwardError::ReadBody(e)
        } else {
            ForwardError::Connect(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::auth::{ProviderFactory, StaticTokenProvider, TokenProvider};
    use crate::context::PathParams;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn static_tokens(token: &'static str) -> Arc<IdTokenClient> {
        let factory: ProviderFactory = Box::new(move |_aud: &str| {
            let provider: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(token));
            Ok(provider)
        });
        Arc::new(IdTokenClient::new("aud", factory))
    }

    fn forwarder(target: &str, tokens: Arc<IdTokenClient>) -> Forwarder {
        let config = GatewayConfig::new(target, "aud")
            .unwrap()
            .with_upstream_timeout(Duration::from_secs(2));
        Forwarder::new(&config, tokens).unwrap()
    }

    fn ctx(raw: &str, body: &'static [u8]) -> Context {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req.with_body(body))
    }

    #[test]
    fn rewrite_requires_segment_boundary() {
        assert_eq!(rewrite_path("/api", "/api/v1/devices"), Some("/v1/devices"));
        assert_eq!(rewrite_path("/api", "/api/"), Some("/"));
        assert_eq!(rewrite_path("/api", "/apiary"), None);
        assert_eq!(rewrite_path("/api", "/v1/api"), None);
    }

    #[test]
    fn upstream_url_keeps_query() {
        let fwd = forwarder("http://upstream.internal/base/", static_tokens("t"));
        assert_eq!(
            fwd.upstream_url("/api/v1/logs/alerts", Some("limit=10")).as_deref(),
            Some("http://upstream.internal/base/v1/logs/alerts?limit=10")
        );
        assert_eq!(
            fwd.upstream_url("/api", None).as_deref(),
            Some("http://upstream.internal/base/")
        );
    }

    #[test]
    fn error_statuses_are_distinct() {
        let token = ForwardError::Token(TokenError::EmptyToken);
        let timeout = ForwardError::Timeout(Duration::from_secs(30));
        let body = ForwardError::InvalidBody(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert_eq!(token.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn auth_detail_can_be_hidden() {
        let shown = ForwardError::Token(TokenError::EmptyToken).into_response(true);
        assert_eq!(
            shown.text(),
            "Failed to authenticate proxy request: identity token provider returned an empty token"
        );
        let hidden = ForwardError::Token(TokenError::EmptyToken).into_response(false);
        assert_eq!(hidden.text(), "Failed to authenticate proxy request");
    }

    #[test]
    fn body_parse_detail_can_be_hidden() {
        let parse = || serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let shown = ForwardError::InvalidBody(parse()).into_response(true);
        assert!(shown.text().starts_with("Invalid JSON body: EOF"));
        let hidden = ForwardError::InvalidBody(parse()).into_response(false);
        assert_eq!(hidden.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hidden.text(), "Invalid JSON body");
    }

    #[tokio::test]
    async fn uses_remainder_captured_by_router() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("devices"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("root"))
            .expect(1)
            .mount(&server)
            .await;

        let fwd = forwarder(&server.uri(), static_tokens("tok"));
        let routed = |raw: &str, rest: &str| {
            let (req, _) = Request::parse(raw.as_bytes()).unwrap();
            let mut params = PathParams::new();
            params.insert(PathParams::WILDCARD, rest);
            Context::with_params(req, params)
        };

        let res = fwd
            .forward(routed("GET /api/v1/devices?page=2 HTTP/1.1\r\n\r\n", "/v1/devices"))
            .await;
        assert_eq!(res.text(), "devices");

        let res = fwd.forward(routed("GET /api HTTP/1.1\r\n\r\n", "")).await;
        assert_eq!(res.text(), "root");
    }

    #[tokio::test]
    async fn relays_upstream_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(serde_json::json!({"email": "a@b.com", "password": "x"})))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_raw(r#"{"error":  "bad credentials"}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fwd = forwarder(&server.uri(), static_tokens("tok"));
        let res = fwd
            .forward(ctx(
                "POST /api/login HTTP/1.1\r\nContent-Type: application/json\r\n\r\n",
                br#"{"email":"a@b.com","password":"x"}"#,
            ))
            .await;

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers().get("content-type"), Some("application/json"));
        assert_eq!(res.text(), r#"{"error":  "bad credentials"}"#);
    }

    #[tokio::test]
    async fn invalid_json_never_reaches_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fwd = forwarder(&server.uri(), static_tokens("tok"));
        let res = fwd
            .forward(ctx("POST /api/login HTTP/1.1\r\n\r\n", b"email=a@b.com"))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(res.text().starts_with("Invalid JSON body: "));
    }

    #[tokio::test]
    async fn query_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/logs/connections"))
            .and(query_param("since", "1h"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let fwd = forwarder(&server.uri(), static_tokens("tok"));
        let res = fwd
            .forward(ctx("GET /api/v1/logs/connections?since=1h HTTP/1.1\r\n\r\n", b""))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text(), "[]");
    }

    #[tokio::test]
    async fn slow_upstream_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let config = GatewayConfig::new(server.uri(), "aud")
            .unwrap()
            .with_upstream_timeout(Duration::from_millis(200));
        let fwd = Forwarder::new(&config, static_tokens("tok")).unwrap();
        let res = fwd.forward(ctx("GET /api/ping-db HTTP/1.1\r\n\r\n", b"")).await;
        assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
