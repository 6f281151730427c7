//! Error types shared by every module of the agent

use std::fmt;

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while wiring, scheduling or relaying messages
///
/// Only [`AgentError::Configuration`] raised during startup is fatal. Every
/// other variant is logged by the module that hit it and handled locally
/// (host toggle, drop, retry on the next cycle).
#[derive(Debug)]
pub enum AgentError {
    /// A required setting is missing or unreadable
    Configuration(String),

    /// The broker could not be reached or rejected an operation
    Connection(String),

    /// No inbound queue is registered under this module name
    UnknownDestination(String),

    /// An envelope does not match any recognized shape
    Validation(String),

    /// A work cycle panicked or exceeded its time bound
    Cycle(String),

    /// JSON encoding or decoding failed
    Serialization(serde_json::Error),

    /// I/O error (config file access, etc.)
    Io(std::io::Error),
}

impl AgentError {
    /// Whether the failure concerns broker connectivity
    pub fn is_connection(&self) -> bool {
        matches!(self, AgentError::Connection(_))
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            AgentError::Connection(msg) => write!(f, "broker connection error: {}", msg),
            AgentError::UnknownDestination(name) => {
                write!(f, "no inbound queue registered for module '{}'", name)
            }
            AgentError::Validation(msg) => write!(f, "invalid envelope: {}", msg),
            AgentError::Cycle(msg) => write!(f, "work cycle aborted: {}", msg),
            AgentError::Serialization(err) => write!(f, "serialization error: {}", err),
            AgentError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Serialization(err) => Some(err),
            AgentError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err)
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Connection(err.to_string())
    }
}
