//! Error types for the rsync engine
//!
//! Errors are structured with fields so the failing step can be reported
//! back to RPC callers verbatim. Variants follow the engine's failure
//! categories: configuration errors are fatal to the current operation,
//! infrastructure errors may be retried by the caller, and state-machine
//! violations are never coerced.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for rsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cluster name is not of the form `provider+cluster`
    #[error("invalid cluster name '{name}': expected <provider>+<cluster>")]
    InvalidClusterName {
        /// The rejected name
        name: String,
    },

    /// Configuration error (unsupported backend, missing git-ops fields, bad ordering)
    #[error("configuration error [{context}]: {message}")]
    Configuration {
        /// Where the bad configuration was detected
        context: String,
        /// Description of what's invalid
        message: String,
    },

    /// A record that was looked up does not exist
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Kind of record (e.g. "cloud config", "app context")
        kind: String,
        /// Rendered key of the record
        key: String,
    },

    /// A record that was created already exists
    #[error("{kind} already exists: {key}")]
    AlreadyExists {
        /// Kind of record
        kind: String,
        /// Rendered key of the record
        key: String,
    },

    /// The cluster did not answer the reachability probe
    #[error("cluster {cluster} unreachable: {message}")]
    ClusterUnreachable {
        /// Cluster name (provider+cluster)
        cluster: String,
        /// Probe failure
        message: String,
    },

    /// Backend operation failure
    #[error("backend error [{backend}] for {cluster}: {message}")]
    Backend {
        /// Cluster the operation targeted
        cluster: String,
        /// Backend type (k8s, github, azureArcV2, fleet, ...)
        backend: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Lifecycle event invoked from a state where it is not legal
    #[error("illegal transition: {event} is not allowed from state {state}")]
    IllegalTransition {
        /// Event that was attempted
        event: String,
        /// Current session state
        state: String,
    },

    /// A blocking wait was cancelled
    #[error("cancelled [{context}]")]
    Cancelled {
        /// What was waiting
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create an invalid cluster name error
    pub fn invalid_cluster_name(name: impl Into<String>) -> Self {
        Self::InvalidClusterName { name: name.into() }
    }

    /// Create a configuration error with context
    pub fn configuration(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a cluster-unreachable error
    pub fn unreachable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterUnreachable {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable backend error
    pub fn backend(
        cluster: impl Into<String>,
        backend: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Backend {
            cluster: cluster.into(),
            backend: backend.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable backend error
    pub fn backend_permanent(
        cluster: impl Into<String>,
        backend: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Backend {
            cluster: cluster.into(),
            backend: backend.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an illegal-transition error
    pub fn illegal_transition(event: impl ToString, state: impl ToString) -> Self {
        Self::IllegalTransition {
            event: event.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, serialization and state-machine errors require a fix
    /// before anything changes, so they are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::InvalidClusterName { .. } => false,
            Error::Configuration { .. } => false,
            Error::NotFound { .. } => false,
            Error::AlreadyExists { .. } => false,
            Error::ClusterUnreachable { .. } => true,
            Error::Backend { retryable, .. } => *retryable,
            Error::IllegalTransition { .. } => false,
            Error::Cancelled { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for errors that signal a configuration problem
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidClusterName { .. } | Error::Configuration { .. }
        )
    }

    /// True when the error is a not-found lookup result
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True when the error reports that the target already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::InvalidClusterName { name } => Some(name),
            Error::ClusterUnreachable { cluster, .. } => Some(cluster),
            Error::Backend { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}
