//! Error types for xproofd
//!
//! Provides a unified error type used across all xpd crates.

use std::path::PathBuf;

/// Main error type for xproofd operations
#[derive(Debug, thiserror::Error)]
pub enum XpdError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot assert directory {path}: {reason}")]
    Directory { path: PathBuf, reason: String },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection timeout after {seconds}s")]
    ConnectionTimeout { seconds: u64 },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    // === Protocol Errors ===

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Request failed ({code}): {message}")]
    Remote { code: i32, message: String },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}:{line}: {message}")]
    ConfigInvalid {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Identity Errors ===

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    // === Session Errors ===

    #[error("Session not found: {0}")]
    SessionNotFound(i32),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    // === Process Errors ===

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Signal {signal} to process {pid} failed: {reason}")]
    Signal {
        pid: i32,
        signal: i32,
        reason: String,
    },

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl XpdError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a process spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::ProcessSpawn(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Connection(_) | Self::ConnectionClosed
        )
    }
}

/// Result type alias using XpdError
pub type Result<T> = std::result::Result<T, XpdError>;
