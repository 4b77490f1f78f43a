use std::collections::HashMap;
use std::env;

/// Read access to environment variables.
///
/// Configuration loading goes through this seam so tests can supply variables
/// without mutating the process environment.
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError>;
}

/// Zero-sized type, delegates to `std::env`.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }
}

/// A fixed set of variables.
///
/// ```
/// use dashgate::config::{MapEnv, ReadEnv};
///
/// let env = MapEnv::from([("PORT", "9090")]);
/// assert_eq!(env.var("PORT").unwrap(), "9090");
/// assert!(env.var("HOST").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for MapEnv
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs
            .into_iter()
            .fold(Self::new(), |env, (k, v)| env.with(k, v))
    }
}

impl ReadEnv for MapEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        self.vars.get(key).cloned().ok_or(env::VarError::NotPresent)
    }
}
