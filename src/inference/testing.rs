//! Scripted engine for exercising the session without native code

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{InferenceError, LoadError, LoadErrorKind};
use crate::inference::artifacts::{resolve_artifact, ModelPath};
use crate::inference::engine::{InferenceEngine, ModelInfo};
use crate::inference::params::GenerationParams;

/// Upper bound on pieces per generation when no natural end is scripted
const SCRIPT_LIMIT: usize = 100_000;

/// Counters shared between a test and the engine it moved into a session
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineProbe {
    loads: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    generations: Arc<AtomicUsize>,
}

impl EngineProbe {
    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedModel;

/// Deterministic engine: piece `i` of a generation is `"<first prompt word>-<i> "`
pub(crate) struct ScriptedEngine {
    probe: EngineProbe,
    context_window: u32,
    token_delay: Duration,
    end_after: Option<usize>,
    fail_after: Option<usize>,
    fail_load: Option<LoadErrorKind>,
    fail_release: bool,
    panic_in_generate: bool,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self {
            probe: EngineProbe::default(),
            context_window: 2048,
            token_delay: Duration::ZERO,
            end_after: None,
            fail_after: None,
            fail_load: None,
            fail_release: false,
            panic_in_generate: false,
        }
    }

    pub(crate) fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }

    pub(crate) fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = context_window;
        self
    }

    pub(crate) fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Emit end-of-generation after `n` pieces
    pub(crate) fn ending_after(mut self, n: usize) -> Self {
        self.end_after = Some(n);
        self
    }

    /// Fail decoding after `n` pieces
    pub(crate) fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub(crate) fn failing_load(mut self, kind: LoadErrorKind) -> Self {
        self.fail_load = Some(kind);
        self
    }

    pub(crate) fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panic_in_generate = true;
        self
    }
}

impl InferenceEngine for ScriptedEngine {
    type Model = ScriptedModel;

    fn load(&mut self, path: &ModelPath) -> Result<(ScriptedModel, ModelInfo), LoadError> {
        if let Some(kind) = self.fail_load {
            return Err(LoadError::new(kind, "scripted load failure"));
        }

        let artifact = resolve_artifact(path)?;
        self.probe.loads.fetch_add(1, Ordering::SeqCst);

        Ok((
            ScriptedModel,
            ModelInfo {
                path: artifact.path,
                context_window: self.context_window,
                vocab_size: 32_000,
                param_count: artifact.metadata.tensor_count,
                size_bytes: artifact.size_bytes,
            },
        ))
    }

    fn generate(
        &mut self,
        _model: &mut ScriptedModel,
        prompt: &str,
        _params: &GenerationParams,
        on_piece: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), InferenceError> {
        self.probe.generations.fetch_add(1, Ordering::SeqCst);
        let word = prompt.split_whitespace().next().unwrap_or("");

        for i in 0..SCRIPT_LIMIT {
            if self.end_after == Some(i) {
                return Ok(());
            }
            if self.fail_after == Some(i) {
                return Err(InferenceError::Decode("scripted decode failure".to_string()));
            }
            if self.panic_in_generate {
                panic!("scripted engine panic");
            }
            if !self.token_delay.is_zero() {
                thread::sleep(self.token_delay);
            }
            if on_piece(&format!("{word}-{i} ")).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn release(&mut self, _model: ScriptedModel) -> Result<(), InferenceError> {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            return Err(InferenceError::Worker("scripted release failure".to_string()));
        }
        Ok(())
    }
}
