//! Generation session and its supporting pieces
//!
//! A [`GenerationSession`] owns one model at a time and drives an
//! [`InferenceEngine`] on a dedicated worker thread.

pub mod artifacts;
pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod params;
pub mod resource;
pub mod session;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use artifacts::{resolve_artifact, validate_gguf, GgufMetadata, ModelArtifact, ModelError, ModelPath, GGUF_MAGIC};
pub use engine::{InferenceEngine, ModelInfo};
#[cfg(feature = "llama")]
pub use llama::LlamaEngine;
pub use params::{GenerationParams, ParameterValidator, RawParams};
pub use resource::ModelResource;
pub use session::{GenerationHandle, GenerationResult, GenerationSession, SessionState, StopReason};
pub use streaming::{ChannelSink, PieceDecoder, StreamToken, Token, TokenSink};
