//! Spindle Core - streaming token generation
//!
//! This crate drives autoregressive generation against a stateful model
//! context: it ingests a prompt, alternates batch evaluation with sampling,
//! and streams each produced token to a consumer on its own thread. Only one
//! generation may own the model context at a time.

// Module declarations
pub mod backend;
pub mod config;
pub mod generation;
pub mod guard;
pub mod history;
pub mod logging;
pub mod sampling;
pub mod service;
pub mod stream;

use thiserror::Error;

/// Token identifier as produced by the tokenizer
pub type TokenId = u32;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Model loading errors
    #[error("Load error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Load {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        model_path: Option<std::path::PathBuf>,
    },

    /// Adapter (lora) application errors
    #[error("Adapter error [{code}]: {message}\nAdapter: {adapter_path:?}\nSuggestion: {suggestion}")]
    Adapter {
        code: &'static str,
        message: String,
        suggestion: String,
        adapter_path: std::path::PathBuf,
    },

    /// Tokenizer operation errors
    #[error("Tokenizer error [{code}]: {message}\nContext: {context}")]
    Tokenizer {
        code: &'static str,
        message: String,
        context: String,
    },

    /// Backend evaluation errors
    #[error("Eval error [{code}]: {message}\nContext: {context}")]
    Eval {
        code: &'static str,
        message: String,
        context: String,
        n_past: Option<usize>,
    },

    /// Configuration parsing and validation errors
    #[error("Configuration error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        field_name: Option<String>,
    },

    /// A generation run terminated abnormally
    #[error(transparent)]
    Run(#[from] RunError),

    /// File system and I/O errors
    #[error("IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    Io {
        code: &'static str,
        message: String,
        path: Option<std::path::PathBuf>,
        suggestion: String,
        #[source]
        source: std::io::Error,
    },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}\nContext: {context}")]
    Internal {
        code: &'static str,
        message: String,
        context: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Terminal condition of a generation run that did not finish normally.
///
/// Cheap to clone so the same value can be delivered to the sink and
/// returned from the run handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("prompt is too long ({n_tokens} tokens, max {max_tokens})")]
    PromptTooLong { n_tokens: usize, max_tokens: usize },

    #[error("failed to eval {n_eval} tokens at position {n_past}: {message}")]
    EvalFailed {
        n_past: usize,
        n_eval: usize,
        message: String,
    },

    #[error("context is full ({n_past} evaluated + {n_pending} pending > {n_ctx})")]
    ContextFull {
        n_past: usize,
        n_pending: usize,
        n_ctx: usize,
    },

    #[error("failed to tokenize prompt: {message}")]
    Tokenize { message: String },
}

impl RunError {
    /// Stable code for programmatic handling, matching [`CoreError::code`]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PromptTooLong { .. } => "RUN_PROMPT_TOO_LONG",
            Self::EvalFailed { .. } => "RUN_EVAL_FAILED",
            Self::ContextFull { .. } => "RUN_CONTEXT_FULL",
            Self::Tokenize { .. } => "RUN_TOKENIZE_FAILED",
        }
    }
}

impl CoreError {
    /// Create a load error with the offending model path
    pub fn load_with_path<S1, S2, S3, P>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
        path: P,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        P: Into<std::path::PathBuf>,
    {
        Self::Load {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            model_path: Some(path.into()),
        }
    }

    /// Create an adapter error
    pub fn adapter<S1, S2, P>(code: &'static str, message: S1, suggestion: S2, path: P) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        P: Into<std::path::PathBuf>,
    {
        Self::Adapter {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
            adapter_path: path.into(),
        }
    }

    /// Create a tokenizer error
    pub fn tokenizer<S1, S2>(code: &'static str, message: S1, context: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Tokenizer {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create an eval error
    pub fn eval<S1, S2>(code: &'static str, message: S1, context: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Eval {
            code,
            message: message.into(),
            context: context.into(),
            n_past: None,
        }
    }

    /// Create a configuration error
    pub fn configuration<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            field_name: None,
        }
    }

    /// Create a configuration error naming the invalid field
    pub fn invalid_field<S1, S2>(code: &'static str, field_name: &str, message: S1, suggestion: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: format!("Validating `{}`", field_name),
            suggestion: suggestion.into(),
            field_name: Some(field_name.to_string()),
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::Load { code, .. } => code,
            Self::Adapter { code, .. } => code,
            Self::Tokenizer { code, .. } => code,
            Self::Eval { code, .. } => code,
            Self::Configuration { code, .. } => code,
            Self::Run(err) => err.code(),
            Self::Io { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }

    /// Status code reported across the host boundary.
    ///
    /// The host only distinguishes success (0) from failure (1).
    pub fn status_code(&self) -> i32 {
        1
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let (code, suggestion) = match err.kind() {
            std::io::ErrorKind::NotFound => (
                "IO_FILE_NOT_FOUND",
                "Check that the file path is correct and the file exists",
            ),
            std::io::ErrorKind::PermissionDenied => (
                "IO_PERMISSION_DENIED",
                "Check file permissions or run with appropriate privileges",
            ),
            std::io::ErrorKind::InvalidData => (
                "IO_INVALID_DATA",
                "The file may be corrupted or in an unexpected format",
            ),
            _ => (
                "IO_UNKNOWN",
                "Check the file system and try the operation again",
            ),
        };

        Self::Io {
            code,
            message: err.to_string(),
            path: None,
            suggestion: suggestion.to_string(),
            source: err,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "INTERNAL_UNKNOWN",
            message: err.to_string(),
            context: "An unexpected error occurred".to_string(),
            source: Some(err),
        }
    }
}

/// Status code for a host-boundary call result (0 success, 1 failure)
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.status_code(),
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        backend::{ModelContext, ModelLoader, Tokenizer},
        config::{LoggingConfig, ModelParams, ServiceConfig},
        generation::{FinishReason, LogitBias, Mirostat, RunSummary, SamplingParams},
        guard::{RunPermit, SingleFlight},
        history::HistoryWindow,
        sampling::{CandidateSet, MirostatState, Sampler, TokenData},
        service::{InferenceService, RunHandle},
        stream::{DeliveryChannel, StreamEvent, TokenSink},
        CoreError, Result, RunError, TokenId,
    };
}

// Re-export key types at the crate root
pub use config::ServiceConfig;
pub use generation::SamplingParams;
pub use service::InferenceService;
pub use stream::StreamEvent;
