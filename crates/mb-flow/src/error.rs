//! Error types for the orchestration domain.

use std::time::Duration;

/// The result type used throughout mb-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required options are missing or invalid.
    #[error("invalid configuration: {}", fields.join(", "))]
    Configuration {
        /// Every offending field, not just the first.
        fields: Vec<String>,
    },

    /// The manifest does not bind hosts to every task in the routine.
    #[error("manifest is missing hosts for: {}", missing.join(", "))]
    ManifestValidation {
        /// Task ids with no hosts in the manifest.
        missing: Vec<String>,
    },

    /// The target environment does not exist on the configuration server.
    #[error("environment '{environment}' not found on '{server_url}'")]
    EnvironmentNotFound {
        /// The environment that was looked up.
        environment: String,
        /// The configuration server that was asked.
        server_url: String,
    },

    /// A routine description references something the plugin does not define.
    #[error("routine syntax error: {message}")]
    RoutineSyntax {
        /// Description of the problem.
        message: String,
    },

    /// The environment lock is held and the caller asked not to wait.
    #[error("environment '{environment}' is locked by {holder}")]
    LockConflict {
        /// The locked environment.
        environment: String,
        /// Description of the current holder.
        holder: String,
    },

    /// Waiting for the environment lock exceeded the configured timeout.
    #[error("timed out after {waited:?} waiting for lock on '{environment}'")]
    LockTimeout {
        /// The locked environment.
        environment: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The lock was taken over by a forced acquisition.
    #[error("lock on '{environment}' forcibly released")]
    LockPreempted {
        /// The environment whose lock was pre-empted.
        environment: String,
    },

    /// A provisioner returned a different number of nodes than requested.
    #[error("expected {expected} provisioned nodes but {actual} were created")]
    UnexpectedProvisionCount {
        /// Nodes requested by the manifest.
        expected: usize,
        /// Nodes the provisioner reported.
        actual: usize,
    },

    /// A remote action failed on a host.
    #[error("remote action failed on {host}: {message}")]
    RemoteAction {
        /// The host the action ran against.
        host: String,
        /// Description of the failure.
        message: String,
    },

    /// The configuration server could not be reached.
    #[error("configuration server unreachable: {message}")]
    RemoteConnection {
        /// Description of the failure.
        message: String,
    },

    /// One or more groups in a stage failed.
    #[error("stage {stage} failed: {}", failures.join("; "))]
    StageFailed {
        /// Zero-based stage index.
        stage: usize,
        /// One entry per failed host or worker.
        failures: Vec<String>,
    },

    /// A worker stopped without returning a result.
    #[error("worker for '{group_id}' aborted: {message}")]
    WorkerAborted {
        /// The node group the worker was running.
        group_id: String,
        /// Description of the abort.
        message: String,
    },

    /// A component was not found on a plugin.
    #[error("component '{component}' not found on plugin '{plugin}'")]
    ComponentNotFound {
        /// The component name.
        component: String,
        /// The plugin that was searched.
        plugin: String,
    },

    /// A component has no version attribute to pin.
    #[error("component '{component}' is not versioned")]
    ComponentNotVersioned {
        /// The component name.
        component: String,
    },

    /// No provisioner is registered under the requested id.
    #[error("provisioner not found: {id}")]
    ProvisionerNotFound {
        /// The requested provisioner id.
        id: String,
    },

    /// A provisioner reported a failure.
    #[error("provision error: {message}")]
    Provision {
        /// Description of the failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },

    /// An error from mb-core.
    #[error("core error: {0}")]
    Core(#[from] mb_core::Error),
}

impl Error {
    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a new routine syntax error.
    #[must_use]
    pub fn routine_syntax(message: impl Into<String>) -> Self {
        Self::RoutineSyntax {
            message: message.into(),
        }
    }

    /// Returns a stable, machine-readable slug for the error kind.
    ///
    /// Job failures carry this so remote pollers can branch on it without
    /// parsing messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::ManifestValidation { .. } => "manifest_validation",
            Self::EnvironmentNotFound { .. } => "environment_not_found",
            Self::RoutineSyntax { .. } => "routine_syntax",
            Self::LockConflict { .. } => "lock_conflict",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockPreempted { .. } => "lock_preempted",
            Self::UnexpectedProvisionCount { .. } => "unexpected_provision_count",
            Self::RemoteAction { .. } => "remote_action",
            Self::RemoteConnection { .. } => "remote_connection",
            Self::StageFailed { .. } => "stage_failed",
            Self::WorkerAborted { .. } => "worker_aborted",
            Self::ComponentNotFound { .. } => "component_not_found",
            Self::ComponentNotVersioned { .. } => "component_not_versioned",
            Self::ProvisionerNotFound { .. } => "provisioner_not_found",
            Self::Provision { .. } => "provision",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
            Self::Core(_) => "core",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_lists_every_field() {
        let err = Error::Configuration {
            fields: vec!["server_url".into(), "ssh.user".into()],
        };
        let message = err.to_string();
        assert!(message.contains("server_url"));
        assert!(message.contains("ssh.user"));
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn preemption_mentions_forced_release() {
        let err = Error::LockPreempted {
            environment: "prod".into(),
        };
        assert_eq!(err.to_string(), "lock on 'prod' forcibly released");
    }

    #[test]
    fn core_errors_convert() {
        let core = mb_core::Error::InvalidInput("nope".into());
        let err: Error = core.into();
        assert_eq!(err.kind(), "core");
    }

    #[test]
    fn serde_errors_convert() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
