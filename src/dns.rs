//! Name resolution strategy for outbound HTTP clients.
//!
//! Deployments that cannot resolve an internal hostname (for example the
//! metadata server) pin it to an address through `DNS_OVERRIDES` instead of
//! patching the resolver in code.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("override `{entry}` is not of the form host=ip")]
    MalformedEntry { entry: String },

    #[error("override for `{host}` has an invalid IP address `{ip}`")]
    InvalidIp { host: String, ip: String },
}

/// How outbound clients resolve hostnames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DnsStrategy {
    /// The operating system resolver.
    #[default]
    System,
    /// Fixed addresses for the listed hosts; everything else uses the system resolver.
    Static(Vec<(String, IpAddr)>),
}

impl DnsStrategy {
    /// Parses `host=ip[,host=ip...]`. Blank input selects [`DnsStrategy::System`].
    ///
    /// ```
    /// use dashgate::dns::DnsStrategy;
    ///
    /// let dns = DnsStrategy::parse("metadata.google.internal=169.254.169.254").unwrap();
    /// assert_eq!(dns.overrides().len(), 1);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`DnsError`] for entries without `=` or with an unparsable IP.
    pub fn parse(raw: &str) -> Result<Self, DnsError> {
        let mut overrides = Vec::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (host, ip) = entry
                .split_once('=')
                .map(|(h, i)| (h.trim(), i.trim()))
                .filter(|(h, _)| !h.is_empty())
                .ok_or_else(|| DnsError::MalformedEntry {
                    entry: entry.to_owned(),
                })?;
            let addr: IpAddr = ip.parse().map_err(|_| DnsError::InvalidIp {
                host: host.to_owned(),
                ip: ip.to_owned(),
            })?;
            overrides.push((host.to_ascii_lowercase(), addr));
        }

        if overrides.is_empty() {
            Ok(Self::System)
        } else {
            Ok(Self::Static(overrides))
        }
    }

    pub fn overrides(&self) -> &[(String, IpAddr)] {
        match self {
            Self::System => &[],
            Self::Static(overrides) => overrides,
        }
    }

    /// Applies the strategy to a client under construction.
    ///
    /// The port is left at `0`, so requests keep the port from their URL.
    pub fn apply(&self, mut builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        for (host, ip) in self.overrides() {
            builder = builder.resolve(host, SocketAddr::new(*ip, 0));
        }
        builder
    }
}

impl fmt::Display for DnsStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Static(overrides) => {
                let entries: Vec<String> = overrides
                    .iter()
                    .map(|(host, ip)| format!("{host}={ip}"))
                    .collect();
                write!(f, "static({})", entries.join(","))
            }
        }
    }
}
