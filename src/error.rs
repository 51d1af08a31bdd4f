//! Error types for the vSphere provisioner
//!
//! Errors carry the machine, server, or hypervisor operation they relate to so a
//! failed reconcile can be traced back to its cause from the logs alone.
//!
//! "Try again later" is not an error here: a task that is still running or a
//! bootstrap collaborator that is not ready yet is reported through
//! [`crate::provisioner::Reconciled::RetryAfter`].

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provisioning operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The Machine or Cluster spec cannot be turned into a VM
    #[error("configuration error for {machine}: {message}")]
    Configuration {
        /// Name of the machine with invalid configuration
        machine: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "machineSpec.disks")
        field: Option<String>,
    },

    /// The hypervisor endpoint could not be parsed
    #[error("invalid vSphere endpoint {server:?}: {message}")]
    InvalidEndpoint {
        /// The endpoint as configured
        server: String,
        /// Why it was rejected
        message: String,
    },

    /// Login to the hypervisor was refused
    #[error("authentication to {server} failed: {message}")]
    Authentication {
        /// Server that refused the login
        server: String,
        /// Description of what failed
        message: String,
    },

    /// The server stopped honouring a session that was live when it was handed out
    #[error("vSphere session on {server} expired: {message}")]
    SessionExpired {
        /// Server that rejected the session
        server: String,
        /// Description of what failed
        message: String,
    },

    /// A hypervisor request failed or timed out
    #[error("vSphere {operation} failed: {message}")]
    Hypervisor {
        /// Operation that failed (e.g., "CloneVM_Task")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// The hypervisor answered with something this provisioner does not understand
    #[error("vSphere protocol error: {message}")]
    Protocol {
        /// Description of the mismatch
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Bootstrap data could not be produced
    #[error("bootstrap error for {machine}: {message}")]
    Bootstrap {
        /// Machine the bootstrap data was requested for
        machine: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "session")
        context: String,
    },
}

impl Error {
    /// Create a configuration error without machine context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            machine: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error for a machine
    pub fn configuration_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            machine: machine.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error for a machine and field path
    pub fn configuration_for_field(
        machine: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            machine: machine.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid endpoint error
    pub fn invalid_endpoint(server: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            server: server.into(),
            message: msg.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(server: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Authentication {
            server: server.into(),
            message: msg.into(),
        }
    }

    /// Create a session expired error
    pub fn session_expired(server: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SessionExpired {
            server: server.into(),
            message: msg.into(),
        }
    }

    /// Create a hypervisor error for the named operation
    pub fn hypervisor(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Hypervisor {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
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

    /// Create a bootstrap error for a machine
    pub fn bootstrap(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            machine: machine.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach a machine name to a configuration error raised without one
    pub fn for_machine(self, name: &str) -> Self {
        match self {
            Self::Configuration {
                machine,
                message,
                field,
            } if machine == UNKNOWN_CONTEXT => Self::Configuration {
                machine: name.to_string(),
                message,
                field,
            },
            other => other,
        }
    }

    /// Whether the outer scheduler should retry on its normal cadence.
    ///
    /// Configuration, endpoint, authentication, and protocol errors need a spec
    /// edit or a version fix; retrying them quickly only produces noise.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Hypervisor { .. } => true,
            Error::SessionExpired { .. } => true,
            Error::Bootstrap { .. } => true,
            Error::Internal { .. } => true,
            Error::Configuration { .. } => false,
            Error::InvalidEndpoint { .. } => false,
            Error::Authentication { .. } => false,
            Error::Protocol { .. } => false,
            Error::Serialization { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
