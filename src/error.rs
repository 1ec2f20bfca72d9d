use thiserror::Error;

/// Main error type for takt with structured error handling
///
/// Covers the whole execution substrate: piece configuration and
/// validation, agent port failures, task store operations, and
/// cancellation. Uses `thiserror` for error chaining.
#[derive(Error, Debug)]
pub enum TaktError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Configuration related error
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Piece validation failed (unknown rule target, bad aggregate syntax, ...)
    #[error("Piece validation error: {message}")]
    Validation { message: String },

    /// Agent port failure
    #[error("Agent error [{persona}]: {message}")]
    Agent {
        persona: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Task record failure
    #[error("Task error [{name}]: {message}")]
    Task { name: String, message: String },

    /// Task store failure
    #[error("Task store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Instruction composition failure
    #[error("Instruction error [{movement}]: {message}")]
    Instruction { movement: String, message: String },

    /// Operation was cancelled via the shared abort signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error for cases not covered above
    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for takt operations
pub type Result<T> = std::result::Result<T, TaktError>;

/// Convenience methods for creating specific error types
impl TaktError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a piece validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an agent error
    pub fn agent<P: Into<String>, S: Into<String>>(persona: P, message: S) -> Self {
        Self::Agent {
            persona: persona.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a task error
    pub fn task<N: Into<String>, S: Into<String>>(name: N, message: S) -> Self {
        Self::Task {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a task store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create an instruction composition error
    pub fn instruction<M: Into<String>, S: Into<String>>(movement: M, message: S) -> Self {
        Self::Instruction {
            movement: movement.into(),
            message: message.into(),
        }
    }
}

impl From<String> for TaktError {
    fn from(error: String) -> Self {
        Self::Other {
            message: error,
            source: None,
        }
    }
}

impl From<&str> for TaktError {
    fn from(error: &str) -> Self {
        Self::Other {
            message: error.to_string(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaktError::validation("rule in movement 'plan' references unknown movement 'x'");
        assert!(err.to_string().contains("plan"));
        assert!(err.to_string().contains("unknown movement 'x'"));
    }

    #[test]
    fn test_error_helpers() {
        let err = TaktError::agent("reviewer", "provider exited with code 1");
        assert_eq!(
            err.to_string(),
            "Agent error [reviewer]: provider exited with code 1"
        );

        let err = TaktError::task("fix-login", "not in running state");
        assert!(err.to_string().contains("fix-login"));

        let err = TaktError::store("failed to replace tasks.yaml");
        assert!(err.to_string().starts_with("Task store error"));

        let err = TaktError::instruction("plan", "no output contracts");
        assert!(err.to_string().contains("[plan]"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TaktError = io.into();
        assert!(matches!(err, TaktError::Io(_)));
    }

    #[test]
    fn test_from_string() {
        let err: TaktError = "something went sideways".into();
        assert_eq!(err.to_string(), "something went sideways");
    }
}
