//! Inference engine capability
//!
//! The session never touches model numerics directly. It drives an
//! [`InferenceEngine`], which knows how to load a model, decode tokens from
//! it, and free it again.

use std::ops::ControlFlow;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{InferenceError, LoadError};
use crate::inference::artifacts::ModelPath;
use crate::inference::params::GenerationParams;

/// Model information after loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Model file that was actually opened
    pub path: PathBuf,
    /// Usable context window, in tokens
    pub context_window: u32,
    /// Vocabulary size
    pub vocab_size: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// A native text-generation backend.
///
/// All methods are called from the session's worker thread only, so neither
/// the engine's model type nor its internals need to be `Send`; the engine
/// value itself is moved onto the worker once.
pub trait InferenceEngine: Send + 'static {
    /// Loaded model handle
    type Model;

    /// Loads the model found at `path`. May block for a long time.
    fn load(&mut self, path: &ModelPath) -> Result<(Self::Model, ModelInfo), LoadError>;

    /// Decodes tokens for `prompt` until the model emits end-of-generation,
    /// the context window is exhausted, or `on_piece` breaks.
    ///
    /// `on_piece` receives each piece of decoded text as soon as it is
    /// available. It is the only place a generation can be stopped, so
    /// cancellation is observed at piece granularity: prompt evaluation and
    /// native tokens still buffered as partial UTF-8 run to the next piece.
    ///
    /// A piece is one delivered [`Token`](crate::inference::streaming::Token).
    /// The caller counts pieces, not native tokens, against `params.max_length`;
    /// the engine uses `params` for sampling.
    ///
    /// # Returns
    /// * `Ok(())` - End-of-generation, a full context window, or a break from `on_piece`
    /// * `Err(InferenceError)` - Decoding failed; pieces already delivered remain valid
    fn generate(
        &mut self,
        model: &mut Self::Model,
        prompt: &str,
        params: &GenerationParams,
        on_piece: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), InferenceError>;

    /// Frees a model. Errors are reported but the model is gone either way.
    fn release(&mut self, model: Self::Model) -> Result<(), InferenceError>;
}
