//! Error types
//!
//! One error type per failure domain, plus [`SessionError`] which wraps them all
//! for the operations that can fail in more than one way.

use std::fmt;

use thiserror::Error;

use crate::inference::session::SessionState;

/// Why a model could not be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadErrorKind {
    /// The model path (or the artifact inside it) does not exist
    PathNotFound,
    /// Artifacts exist but are truncated or not a model at all
    CorruptArtifacts,
    /// Artifacts are a model, but not one this engine can read
    IncompatibleFormat,
    /// Native initialization ran out of memory
    OutOfMemory,
    /// A model is already held (or being loaded) by this session or process
    AlreadyLoaded,
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadErrorKind::PathNotFound => "path not found",
            LoadErrorKind::CorruptArtifacts => "corrupt artifacts",
            LoadErrorKind::IncompatibleFormat => "incompatible format",
            LoadErrorKind::OutOfMemory => "out of memory",
            LoadErrorKind::AlreadyLoaded => "already loaded",
        };
        f.write_str(name)
    }
}

/// Model loading failed; the session holds no model afterwards
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Failed to load model ({kind}): {message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A generation parameter was outside its valid domain
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid value for `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// An operation was issued in a state that does not allow it
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidStateError {
    #[error("Cannot {operation} while session is {state}")]
    Session {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Model resource has already been released")]
    Released,
}

/// Errors raised by the engine while a generation is running
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("Failed to create context: {0}")]
    Context(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Prompt of {prompt_tokens} tokens does not fit a context of {context_window}")]
    ContextOverflow {
        prompt_tokens: usize,
        context_window: u32,
    },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

/// Any error a session operation can report
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}
