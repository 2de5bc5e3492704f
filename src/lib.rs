//! genai-session
//!
//! On-device text generation with a single loaded model per session:
//! parameter validation, streamed token delivery, cooperative cancellation,
//! and explicit model release.

pub mod config;
pub mod error;
pub mod inference;
pub mod logging;

pub use config::SessionConfig;
pub use error::{InferenceError, InvalidStateError, LoadError, LoadErrorKind, SessionError, ValidationError};
#[cfg(feature = "llama")]
pub use inference::LlamaEngine;
pub use inference::{
    ChannelSink, GenerationHandle, GenerationParams, GenerationResult, GenerationSession, InferenceEngine, ModelInfo,
    ModelPath, ParameterValidator, RawParams, SessionState, StopReason, StreamToken, Token, TokenSink,
};
