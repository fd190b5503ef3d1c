//! # Routes and Normalization
//!
//! A [`Route`] maps a public hostname to a local `host:port` target. Both
//! halves are normalized before they are stored or looked up, so the agent's
//! config store and the gateway's routing table agree on identity:
//!
//! - **Hostnames** are lowercased, trailing dots stripped, and must look
//!   like a DNS domain (at least one `.`, no spaces, no port).
//! - **Targets** must carry a `:port` and no URL scheme.
//! - **`Host` headers** get a lenient variant of the same treatment that
//!   also strips an attached port (`app.example.com:8080`, `[::1]:8080`).
//!
//! All three normalizations are idempotent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One published mapping from public hostname to local target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub hostname: String,
    pub target: String,
}

/// Validation failures for route fields. Rejected at the boundary that
/// received them; never stored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("hostname is required")]
    EmptyHostname,

    #[error("hostname cannot contain spaces")]
    HostnameWithSpaces,

    #[error("hostname cannot include a port")]
    HostnameWithPort,

    #[error("hostname must be a domain, e.g. app.example.com")]
    HostnameNotADomain,

    #[error("target is required")]
    EmptyTarget,

    #[error("target should be host:port, e.g. 127.0.0.1:3000")]
    TargetWithScheme,

    #[error("target must include a port, e.g. 127.0.0.1:3000")]
    TargetWithoutPort,
}

/// Strict hostname normalization for routes entering the config store or
/// the routing table.
pub fn normalize_hostname(hostname: &str) -> Result<String, RouteError> {
    let host = hostname.trim().to_ascii_lowercase();
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return Err(RouteError::EmptyHostname);
    }
    if host.contains(' ') {
        return Err(RouteError::HostnameWithSpaces);
    }
    if host.contains(':') {
        return Err(RouteError::HostnameWithPort);
    }
    if !host.contains('.') {
        return Err(RouteError::HostnameNotADomain);
    }
    Ok(host.to_string())
}

/// Target normalization: `host:port`, no scheme.
pub fn normalize_target(target: &str) -> Result<String, RouteError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(RouteError::EmptyTarget);
    }
    if target.contains("http://") || target.contains("https://") {
        return Err(RouteError::TargetWithScheme);
    }
    if !target.contains(':') {
        return Err(RouteError::TargetWithoutPort);
    }
    Ok(target.to_string())
}

/// Lenient normalization for inbound `Host` header values: lowercase,
/// strip an attached port (plain or bracketed-IPv6 form), strip trailing
/// dots. Never fails; an empty result means the header was unusable.
pub fn normalize_host_header(host: &str) -> String {
    let mut host = host.trim().to_ascii_lowercase();

    if let Some(rest) = host.strip_prefix('[') {
        // "[::1]:8080" and "[::1]" both reduce to the address itself.
        if let Some(end) = rest.find(']') {
            host = rest[..end].to_string();
        }
    } else if let Some((name, _port)) = host.rsplit_once(':') {
        // A second colon means a bare IPv6 address; leave it alone.
        if !name.contains(':') {
            host = name.to_string();
        }
    }

    host.trim_end_matches('.').to_string()
}
