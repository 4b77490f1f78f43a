//! Per-request context handed to route handlers and middleware.

use std::collections::HashMap;

use crate::Request;

/// Path parameters captured by the matched route.
///
/// Wildcard routes (`/api/*`) store the unmatched remainder under
/// [`PathParams::WILDCARD`].
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    /// Key under which wildcard routes store the path remainder.
    pub const WILDCARD: &'static str = "wildcard";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// The remainder matched by a wildcard route, if any.
    pub fn wildcard(&self) -> Option<&str> {
        self.get(Self::WILDCARD)
    }
}

/// A request together with what routing learned about it.
pub struct Context {
    request: Request,
    params: PathParams,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self::with_params(request, PathParams::new())
    }

    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self { request, params }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Decodes the request body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the body is not valid JSON for `T`.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}
