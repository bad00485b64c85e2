//! Error taxonomy shared by the orchestration context and the client.
//!
//! Errors raised inside `schedule_activity` / `schedule_sub_orchestration` are
//! converted into [`Error::ActivityFailed`] at the call site, so orchestration
//! code can branch on failures uniformly. Errors escaping the orchestration
//! itself terminate the run and are reported through [`FailureDetails`].
//!
//! # Example Usage
//!
//! ```rust
//! use duroxide_sim::Error;
//!
//! let err = Error::activity_failed("ProcessActivity", "Invalid data");
//! assert_eq!(err.category(), "ActivityFailed");
//! assert_eq!(err.attempt(), Some(1));
//!
//! // Orchestration code can raise plain application errors
//! let app: Error = "approval rejected".into();
//! assert_eq!(app.category(), "OrchestrationFailed");
//! ```

use serde::{Deserialize, Serialize};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every activity call is made exactly once; failures always report this attempt number.
pub const SINGLE_ATTEMPT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Unknown instance id passed to a client operation or to `raise_event_to`.
    #[error("instance not found: {instance}")]
    InstanceNotFound { instance: String },

    /// A run with this instance id is still in flight.
    #[error("instance already running: {instance}")]
    InstanceAlreadyRunning { instance: String },

    /// Activity (or child orchestration) lookup or execution failed.
    #[error("task '{name}' failed on attempt {attempt}: {cause}")]
    ActivityFailed { name: String, attempt: u32, cause: String },

    /// A payload could not be coerced to the requested shape.
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    /// A cancellable wait (timer or external event) was canceled.
    #[error("{operation} was canceled")]
    Canceled { operation: String },

    /// An orchestration name passed to the client is not registered.
    #[error("unregistered orchestration: {name}")]
    Unregistered { name: String },

    /// Application error raised by orchestration code.
    #[error("{message}")]
    Orchestration { message: String },

    /// A timed client wait elapsed before the run settled.
    #[error("timed out waiting for instance {instance}")]
    Timeout { instance: String },

    /// The runtime was shut down before the run settled.
    #[error("runtime shut down")]
    Shutdown,
}

impl Error {
    /// Build an `ActivityFailed` error for the single attempt the engine makes.
    pub fn activity_failed(name: impl Into<String>, cause: impl Into<String>) -> Self {
        Error::ActivityFailed {
            name: name.into(),
            attempt: SINGLE_ATTEMPT,
            cause: cause.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Error::TypeMismatch { message: message.into() }
    }

    pub fn canceled(operation: impl Into<String>) -> Self {
        Error::Canceled {
            operation: operation.into(),
        }
    }

    pub fn instance_not_found(instance: impl Into<String>) -> Self {
        Error::InstanceNotFound {
            instance: instance.into(),
        }
    }

    /// Stable category string reported in [`FailureDetails`].
    pub fn category(&self) -> &'static str {
        match self {
            Error::InstanceNotFound { .. } => "InstanceNotFound",
            Error::InstanceAlreadyRunning { .. } => "InstanceAlreadyRunning",
            Error::ActivityFailed { .. } => "ActivityFailed",
            Error::TypeMismatch { .. } => "TypeMismatch",
            Error::Canceled { .. } => "Canceled",
            Error::Unregistered { .. } => "Unregistered",
            Error::Orchestration { .. } => "OrchestrationFailed",
            Error::Timeout { .. } => "Timeout",
            Error::Shutdown => "Shutdown",
        }
    }

    /// Attempt number for task failures.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Error::ActivityFailed { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled { .. })
    }
}

impl From<String> for Error {
    /// Plain strings become application errors raised by orchestration code.
    fn from(message: String) -> Self {
        Error::Orchestration { message }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

/// Structured failure reported for a `Failed` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    /// Stable error category (see [`Error::category`]).
    pub category: String,
    /// Human-readable message of the single reportable cause.
    pub message: String,
}

impl FailureDetails {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Failure reported when orchestration code panics.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "orchestration panicked".to_string()
        };
        Self::new("Panic", message)
    }

    pub fn display_message(&self) -> String {
        format!("{}: {}", self.category, self.message)
    }
}

impl From<&Error> for FailureDetails {
    fn from(err: &Error) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl std::fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}
