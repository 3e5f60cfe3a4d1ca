//! Error types for the migration library.

use crate::transport::TransportFailure;
use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relational store query or connection error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection could not be established, with context
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// HTTP client construction or protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote API call failed after the transport gave up
    #[error(transparent)]
    Transport(#[from] TransportFailure),

    /// A single legacy record could not be migrated
    #[error("{kind} [{legacy_id}]: {message}")]
    Record {
        kind: String,
        legacy_id: i64,
        message: String,
    },

    /// A stage could not run at all
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    /// An identity map key was assigned a second, different handle
    #[error("Identity map {map}: legacy id {legacy_id} already mapped to {existing}, refusing {attempted}")]
    Remap {
        map: String,
        legacy_id: i64,
        existing: String,
        attempted: String,
    },

    /// Postcondition mismatch; the run must not continue
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Checkpoint file error
    #[error("Checkpoint error: {0}")]
    State(String),

    /// Config fingerprint mismatch on resume
    #[error("Config has changed since the checkpoints were written - cannot resume. Clear the resume directory to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Connection {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a per-record error
    pub fn record(kind: impl Into<String>, legacy_id: i64, message: impl Into<String>) -> Self {
        MigrateError::Record {
            kind: kind.into(),
            legacy_id,
            message: message.into(),
        }
    }

    /// Create a Stage error
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// True for errors that must terminate the run rather than skip a record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Config(_)
                | MigrateError::ConfigChanged
                | MigrateError::Invariant(_)
                | MigrateError::Remap { .. }
                | MigrateError::State(_)
                | MigrateError::Cancelled
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::ConfigChanged => 2,
            MigrateError::Invariant(_) | MigrateError::Remap { .. } => 3,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
