//! Loaded model ownership
//!
//! [`ModelResource`] is the single slot a session keeps its native model in.
//! It lives on the worker thread and is the only path to the model.

use crate::error::{InvalidStateError, LoadError, LoadErrorKind};
use crate::inference::artifacts::ModelPath;
use crate::inference::engine::{InferenceEngine, ModelInfo};

struct Held<M> {
    model: M,
    info: ModelInfo,
}

/// Exclusive owner of at most one loaded model
pub struct ModelResource<M> {
    held: Option<Held<M>>,
}

impl<M> ModelResource<M> {
    /// A slot with nothing loaded
    pub fn empty() -> Self {
        Self { held: None }
    }

    /// Loads a model into this slot.
    ///
    /// Fails with [`LoadErrorKind::AlreadyLoaded`] if the slot is occupied; the
    /// existing model is left untouched.
    pub fn acquire<E>(&mut self, engine: &mut E, path: &ModelPath) -> Result<&ModelInfo, LoadError>
    where
        E: InferenceEngine<Model = M>,
    {
        if let Some(held) = &self.held {
            return Err(LoadError::new(
                LoadErrorKind::AlreadyLoaded,
                format!("{} is still loaded", held.info.path.display()),
            ));
        }

        let (model, info) = engine.load(path)?;
        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            info.path.display(),
            info.param_count,
            info.vocab_size,
            info.context_window
        );

        let held = self.held.insert(Held { model, info });
        Ok(&held.info)
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Borrows the loaded model, or reports that it has been released
    pub fn model_mut(&mut self) -> Result<&mut M, InvalidStateError> {
        self.held
            .as_mut()
            .map(|held| &mut held.model)
            .ok_or(InvalidStateError::Released)
    }

    /// Frees the model, if any. Calling this on an empty slot is a no-op.
    ///
    /// A failing engine release is logged; the slot is empty afterwards regardless.
    pub fn release<E>(&mut self, engine: &mut E)
    where
        E: InferenceEngine<Model = M>,
    {
        let Some(held) = self.held.take() else {
            return;
        };

        let path = held.info.path;
        match engine.release(held.model) {
            Ok(()) => tracing::info!("Model released: {}", path.display()),
            Err(e) => tracing::error!("Error releasing model {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::artifacts::tests::model_dir;
    use crate::inference::testing::ScriptedEngine;

    #[test]
    fn test_acquire_and_release() {
        let dir = model_dir();
        let mut engine = ScriptedEngine::new();
        let probe = engine.probe();
        let mut resource = ModelResource::empty();

        let info = resource.acquire(&mut engine, &ModelPath::from(dir.path())).unwrap();
        assert!(info.path.ends_with("model.gguf"));
        assert!(resource.is_held());
        assert!(resource.model_mut().is_ok());

        resource.release(&mut engine);
        assert!(!resource.is_held());
        assert_eq!(probe.loads(), 1);
        assert_eq!(probe.releases(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = model_dir();
        let mut engine = ScriptedEngine::new();
        let probe = engine.probe();
        let mut resource = ModelResource::empty();

        // Never acquired
        resource.release(&mut engine);
        assert_eq!(probe.releases(), 0);

        resource.acquire(&mut engine, &ModelPath::from(dir.path())).unwrap();
        resource.release(&mut engine);
        resource.release(&mut engine);
        assert_eq!(probe.releases(), 1);
    }

    #[test]
    fn test_use_after_release_is_invalid_state() {
        let dir = model_dir();
        let mut engine = ScriptedEngine::new();
        let mut resource = ModelResource::empty();
        resource.acquire(&mut engine, &ModelPath::from(dir.path())).unwrap();
        resource.release(&mut engine);

        assert_eq!(resource.model_mut().err(), Some(InvalidStateError::Released));
        assert!(!resource.is_held());
    }

    #[test]
    fn test_second_acquire_rejected() {
        let dir = model_dir();
        let mut engine = ScriptedEngine::new();
        let probe = engine.probe();
        let mut resource = ModelResource::empty();
        resource.acquire(&mut engine, &ModelPath::from(dir.path())).unwrap();

        let error = resource
            .acquire(&mut engine, &ModelPath::from(dir.path()))
            .unwrap_err();
        assert_eq!(error.kind, LoadErrorKind::AlreadyLoaded);
        assert!(resource.is_held());
        assert_eq!(probe.loads(), 1);
    }

    #[test]
    fn test_failed_release_still_empties_slot() {
        let dir = model_dir();
        let mut engine = ScriptedEngine::new().failing_release();
        let mut resource = ModelResource::empty();
        resource.acquire(&mut engine, &ModelPath::from(dir.path())).unwrap();

        resource.release(&mut engine);
        assert!(!resource.is_held());
    }

    #[test]
    fn test_failed_acquire_leaves_slot_empty() {
        let mut engine = ScriptedEngine::new();
        let mut resource = ModelResource::empty();

        let error = resource
            .acquire(&mut engine, &ModelPath::from("missing/path"))
            .unwrap_err();
        assert_eq!(error.kind, LoadErrorKind::PathNotFound);
        assert!(!resource.is_held());
    }
}
