//! Service endpoint discovery from the environment
//!
//! Follows the Kubernetes service-link convention: the service name is read
//! from `RSYNC_SERVICE_NAME`, and its address from `<NAME>_SERVICE_HOST` and
//! `<NAME>_SERVICE_PORT`.

use std::fmt;

/// Environment variable holding the service name
pub const SERVICE_NAME_VAR: &str = "RSYNC_SERVICE_NAME";
/// Service name used when the variable is unset
pub const DEFAULT_SERVICE_NAME: &str = "rsync";
/// Fallback host
pub const DEFAULT_HOST: &str = "localhost";
/// Fallback port
pub const DEFAULT_PORT: u16 = 9031;

/// Source of environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Host and port of the synchronization service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn env_prefix(service_name: &str) -> String {
    service_name.to_uppercase().replace('-', "_")
}

/// Resolve the service endpoint.
///
/// Falls back to `localhost:9031` when the host is unset or empty, or when
/// the port is unset or not a valid port number.
pub fn resolve_service_endpoint(env: &dyn EnvSource) -> ServiceEndpoint {
    let name = env
        .var(SERVICE_NAME_VAR)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let prefix = env_prefix(&name);

    let host = env
        .var(&format!("{prefix}_SERVICE_HOST"))
        .filter(|h| !h.trim().is_empty());
    let port = env
        .var(&format!("{prefix}_SERVICE_PORT"))
        .and_then(|p| p.trim().parse::<u16>().ok())
        .filter(|p| *p != 0);

    match (host, port) {
        (Some(host), Some(port)) => ServiceEndpoint { host, port },
        _ => ServiceEndpoint::default(),
    }
}
