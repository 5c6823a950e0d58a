//! Error handling for Orbitone
//!
//! Errors are raised inside the engine and caught at the facade. Nothing in
//! this enum is ever returned from a trigger or setter on `AudioEngine`.

use thiserror::Error;

/// Result type alias for Orbitone operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for engine internals
#[derive(Error, Debug)]
pub enum EngineError {
    // Platform Errors
    #[error("Audio platform is incompatible: {reason}")]
    PlatformIncompatible { reason: String },

    #[error("Audio context could not be resumed: {reason}")]
    ContextResume { reason: String },

    #[error("Startup failed while building {stage}: {reason}")]
    TransientInit { stage: String, reason: String },

    // Graph Errors
    #[error("Could not create {node} node: {reason}")]
    NodeCreation { node: String, reason: String },

    #[error("Could not connect node {from} to {to}: {reason}")]
    Connection { from: u64, to: u64, reason: String },

    #[error("Parameter {param} is not available on node {node}")]
    ParameterQuirk { node: String, param: String },

    #[error("Unknown node id {node}")]
    UnknownNode { node: u64 },

    #[error("Could not schedule event at {at:.4}s: {reason}")]
    Scheduling { at: f64, reason: String },

    // Musical Input Errors
    #[error("Invalid note name: {input}")]
    InvalidNote { input: String },

    #[error("Invalid interval notation: {input}")]
    InvalidInterval { input: String },

    #[error("Unknown synth preset: {name}")]
    UnknownPreset { name: String },

    // Configuration Errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    // I/O Errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Get the error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::PlatformIncompatible { .. } => "PLATFORM_INCOMPATIBLE",
            EngineError::ContextResume { .. } => "CONTEXT_RESUME",
            EngineError::TransientInit { .. } => "TRANSIENT_INIT",
            EngineError::NodeCreation { .. } => "NODE_CREATION",
            EngineError::Connection { .. } => "CONNECTION",
            EngineError::ParameterQuirk { .. } => "PARAMETER_QUIRK",
            EngineError::UnknownNode { .. } => "UNKNOWN_NODE",
            EngineError::Scheduling { .. } => "SCHEDULING",
            EngineError::InvalidNote { .. } => "INVALID_NOTE",
            EngineError::InvalidInterval { .. } => "INVALID_INTERVAL",
            EngineError::UnknownPreset { .. } => "UNKNOWN_PRESET",
            EngineError::Config { .. } => "CONFIG",
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Check if a later attempt at the same operation may succeed
    ///
    /// Incompatibility is decided once per platform and never retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::ContextResume { .. } => true,
            EngineError::TransientInit { .. } => true,
            EngineError::NodeCreation { .. } => true,
            EngineError::Connection { .. } => true,
            EngineError::Scheduling { .. } => true,
            EngineError::ParameterQuirk { .. } => true,
            _ => false,
        }
    }

    /// Wrap a construction failure as a retryable startup error for `stage`
    pub fn during(self, stage: &str) -> Self {
        match self {
            EngineError::TransientInit { .. } => self,
            other => EngineError::TransientInit {
                stage: stage.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = EngineError::InvalidNote {
            input: "H9".to_string(),
        };
        assert_eq!(err.error_code(), "INVALID_NOTE");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_during_wraps_once() {
        let err = EngineError::NodeCreation {
            node: "reverb".to_string(),
            reason: "boom".to_string(),
        }
        .during("master chain");
        assert_eq!(err.error_code(), "TRANSIENT_INIT");
        assert!(err.is_recoverable());

        let again = err.during("voices");
        match again {
            EngineError::TransientInit { stage, .. } => assert_eq!(stage, "master chain"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
