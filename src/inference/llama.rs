//! llama.cpp engine
//!
//! [`InferenceEngine`] implementation over `llama-cpp-2` for GGUF models.
//!
//! llama.cpp allows one backend per process. It is initialized lazily on the
//! first load, which happens on the session worker, and freed when the engine
//! is dropped with the worker.

use std::num::NonZeroU32;
use std::ops::ControlFlow;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::LlamaCppError;

use crate::config::SessionConfig;
use crate::error::{InferenceError, LoadError, LoadErrorKind};
use crate::inference::artifacts::{resolve_artifact, ModelPath};
use crate::inference::engine::{InferenceEngine, ModelInfo};
use crate::inference::params::GenerationParams;
use crate::inference::streaming::PieceDecoder;

/// Below this temperature sampling is greedy
const GREEDY_TEMPERATURE: f32 = 0.01;

/// Tokens of history the repetition penalty looks at
const PENALTY_WINDOW: i32 = 64;

/// llama.cpp-backed engine
pub struct LlamaEngine {
    backend: Option<LlamaBackend>,
    config: SessionConfig,
}

impl LlamaEngine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            backend: None,
            config,
        }
    }

    fn backend(&mut self) -> Result<&LlamaBackend, LoadError> {
        if self.backend.is_none() {
            let backend = LlamaBackend::init().map_err(|e| match e {
                LlamaCppError::BackendAlreadyInitialized => LoadError::new(
                    LoadErrorKind::AlreadyLoaded,
                    "llama.cpp backend is already initialized in this process",
                ),
                other => LoadError::new(
                    LoadErrorKind::IncompatibleFormat,
                    format!("Failed to initialize backend: {other}"),
                ),
            })?;
            tracing::info!("LlamaBackend initialized in worker thread");
            self.backend = Some(backend);
        }

        self.backend
            .as_ref()
            .ok_or_else(|| LoadError::new(LoadErrorKind::IncompatibleFormat, "backend unavailable"))
    }

    fn context_window(&self, model: &LlamaModel) -> u32 {
        self.config.context_size.min(model.n_ctx_train()).max(1)
    }
}

impl InferenceEngine for LlamaEngine {
    type Model = LlamaModel;

    fn load(&mut self, path: &ModelPath) -> Result<(LlamaModel, ModelInfo), LoadError> {
        // Header check first: cheap, and keeps obviously bad files away from native code
        let artifact = resolve_artifact(path)?;
        artifact.check_budget(self.config.memory_budget_bytes())?;
        tracing::debug!("GGUF validation passed for {}", artifact.path.display());

        let model_params = LlamaModelParams::default().with_n_gpu_layers(self.config.gpu_layers);
        let backend = self.backend()?;
        let model = LlamaModel::load_from_file(backend, &artifact.path, &model_params)
            .map_err(|e| LoadError::new(LoadErrorKind::CorruptArtifacts, e.to_string()))?;

        let info = ModelInfo {
            context_window: self.context_window(&model),
            vocab_size: u32::try_from(model.n_vocab()).unwrap_or(0),
            param_count: model.n_params() as u64,
            size_bytes: model.size() as u64,
            path: artifact.path,
        };

        Ok((model, info))
    }

    fn generate(
        &mut self,
        model: &mut LlamaModel,
        prompt: &str,
        params: &GenerationParams,
        on_piece: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), InferenceError> {
        let backend = self.backend.as_ref().ok_or(InferenceError::BackendNotInitialized)?;
        let model: &LlamaModel = model;

        let prompt = if self.config.apply_chat_template {
            match build_chat_prompt(model, prompt) {
                Ok(chat_prompt) => chat_prompt,
                Err(error) => {
                    tracing::warn!("Chat template not applied: {error}");
                    prompt.to_string()
                }
            }
        } else {
            prompt.to_string()
        };

        let tokens = model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| InferenceError::Tokenization(e.to_string()))?;
        if tokens.is_empty() {
            return Err(InferenceError::Tokenization("prompt produced no tokens".to_string()));
        }

        let n_ctx = self.context_window(model);
        if tokens.len() >= n_ctx as usize {
            return Err(InferenceError::ContextOverflow {
                prompt_tokens: tokens.len(),
                context_window: n_ctx,
            });
        }
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

        // The whole prompt is decoded in one batch
        let n_batch = self.config.batch_size.max(tokens.len() as u32);
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(n_batch);
        let mut ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| InferenceError::Context(e.to_string()))?;

        let seed = if self.config.seed == 0 {
            rand_seed()
        } else {
            self.config.seed
        };
        let mut sampler = build_sampler(params, seed);

        run_decode(&mut ctx, model, &tokens, n_ctx, &mut sampler, on_piece)
    }

    fn release(&mut self, model: LlamaModel) -> Result<(), InferenceError> {
        drop(model);
        Ok(())
    }
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let user_message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[user_message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

fn build_sampler(params: &GenerationParams, seed: u32) -> LlamaSampler {
    let mut chain = Vec::new();

    if let Some(penalty) = params.repetition_penalty {
        chain.push(LlamaSampler::penalties(PENALTY_WINDOW, penalty, 0.0, 0.0));
    }

    if params.temperature < GREEDY_TEMPERATURE {
        chain.push(LlamaSampler::greedy());
    } else {
        if let Some(top_k) = params.top_k {
            chain.push(LlamaSampler::top_k(i32::try_from(top_k).unwrap_or(i32::MAX)));
        }
        if let Some(top_p) = params.top_p {
            chain.push(LlamaSampler::top_p(top_p, 1));
        }
        chain.push(LlamaSampler::temp(params.temperature));
        chain.push(LlamaSampler::dist(seed));
    }

    LlamaSampler::chain_simple(chain)
}

/// Feeds the prompt, then samples until end-of-generation, a full context,
/// or `on_piece` breaks
fn run_decode(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: &[LlamaToken],
    n_ctx: u32,
    sampler: &mut LlamaSampler,
    on_piece: &mut dyn FnMut(&str) -> ControlFlow<()>,
) -> Result<(), InferenceError> {
    let mut batch = LlamaBatch::new(prompt_tokens.len(), 1);
    let last = prompt_tokens.len() - 1;
    for (i, token) in prompt_tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last)
            .map_err(|e| InferenceError::Decode(format!("Failed to add token to batch: {e}")))?;
    }

    ctx.decode(&mut batch)
        .map_err(|e| InferenceError::Decode(format!("Failed to decode prompt: {e}")))?;

    let mut decoder = PieceDecoder::new();
    let mut n_past = prompt_tokens.len() as i32;

    while n_past < n_ctx as i32 {
        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| InferenceError::Decode(format!("Failed to convert token to bytes: {e}")))?;

        if let Some(piece) = decoder.push(&bytes) {
            if on_piece(&piece).is_break() {
                return Ok(());
            }
        }

        batch.clear();
        batch
            .add(token, n_past, &[0], true)
            .map_err(|e| InferenceError::Decode(format!("Failed to add token to batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| InferenceError::Decode(format!("Failed to decode: {e}")))?;
        n_past += 1;
    }

    if let Some(piece) = decoder.finish() {
        let _ = on_piece(&piece);
    }

    Ok(())
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
