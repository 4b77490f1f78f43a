//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! | Pattern        | Example match       | Captured params               |
//! |----------------|---------------------|-------------------------------|
//! | `/healthz`     | `/healthz`          | *(none)*                      |
//! | `/devices/:id` | `/devices/42`       | `id → "42"`                   |
//! | `/api/*`       | `/api/v1/devices`   | `wildcard → "/v1/devices"`    |
//!
//! Trailing slashes are normalized on both patterns and incoming paths.
//! A wildcard only matches on a segment boundary: `/api/*` accepts `/api` and
//! `/api/...` but not `/apifoo`.
//!
//! Routes are matched in registration order and the first match wins. Every
//! dispatch, including the 404 for unmatched requests, runs through the
//! middleware registered with [`Router::layer`].

use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::middleware::{BoxResponse, Middleware, MiddlewareHandler, Next, from_middleware};
use crate::{Method, Request, Response, StatusCode};

/// Type-erased async handler that turns a [`Context`] into a [`Response`].
pub type Handler = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    // Prefix without its trailing `/*`; empty for the catch-all `/*`.
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    /// Compiles a pattern string.
    ///
    /// Ends with `/*` → wildcard; contains `:` → parameterized; otherwise exact.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_owned());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_owned()),
                    None => Segment::Static(s.to_owned()),
                })
                .collect();

            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_owned())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        match self {
            Pattern::Exact(p) => (p == trim_trailing_slash(path)).then(PathParams::new),
            Pattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = trim_trailing_slash(path)
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .collect();

                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => params.insert(name.as_str(), path_seg),
                    }
                }

                Some(params)
            }
            Pattern::Wildcard(prefix) => {
                // The raw path is used so the remainder keeps its trailing slash.
                let suffix = path.strip_prefix(prefix.as_str())?;
                if !suffix.is_empty() && !suffix.starts_with('/') {
                    return None;
                }
                let mut params = PathParams::new();
                params.insert(PathParams::WILDCARD, suffix);
                Some(params)
            }
        }
    }
}

// A registered route; `method: None` matches every method.
struct Route {
    method: Option<Method>,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> Option<PathParams> {
        match &self.method {
            Some(m) if m != method => None,
            _ => self.pattern.matches(path),
        }
    }
}

/// HTTP request router.
///
/// # Examples
///
/// ```rust,no_run
/// use dashgate::context::Context;
/// use dashgate::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/healthz", |_ctx: Context| async { Response::new(StatusCode::OK) });
/// router.any("/api/*", |ctx: Context| async move {
///     let rest = ctx.params().wildcard().unwrap_or("/").to_owned();
///     Response::new(StatusCode::OK).body(rest)
/// });
/// ```
pub struct Router {
    routes: Vec<Route>,
    middlewares: Arc<[MiddlewareHandler]>,
    not_found: Handler,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            middlewares: Arc::from(Vec::new()),
            not_found: Arc::new(|_ctx: Context| -> BoxResponse {
                Box::pin(async { Response::new(StatusCode::NOT_FOUND).body("Not Found") })
            }),
        }
    }

    /// Registers a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.on(Some(Method::Get), path, handler);
    }

    /// Registers a handler for `HEAD` requests matching `path`.
    pub fn head(&mut self, path: &str, handler: impl IntoHandler) {
        self.on(Some(Method::Head), path, handler);
    }

    /// Registers a handler for every method on `path`.
    pub fn any(&mut self, path: &str, handler: impl IntoHandler) {
        self.on(None, path, handler);
    }

    /// Registers a handler for `method` (or every method when `None`).
    pub fn on(&mut self, method: Option<Method>, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    /// Appends a middleware layer. Layers run in registration order, outermost first.
    pub fn layer<M>(&mut self, middleware: M)
    where
        M: Middleware + 'static,
    {
        let mut chain = self.middlewares.to_vec();
        chain.push(from_middleware(Arc::new(middleware)));
        self.middlewares = Arc::from(chain);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `request` to the first matching route, through the middleware chain.
    ///
    /// Unmatched requests get `404 Not Found`.
    pub async fn route(&self, request: Request) -> Response {
        let matched = self
            .routes
            .iter()
            .find_map(|route| {
                route
                    .matches(request.method(), request.path())
                    .map(|params| (Arc::clone(&route.handler), params))
            });

        let (endpoint, ctx) = match matched {
            Some((handler, params)) => (handler, Context::with_params(request, params)),
            None => (Arc::clone(&self.not_found), Context::new(request)),
        };

        Next::new(Arc::clone(&self.middlewares), endpoint)
            .run(ctx)
            .await
    }
}
