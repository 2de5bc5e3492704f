//! Generation session
//!
//! [`GenerationSession`] coordinates loading, generating, stopping and
//! unloading one model.
//!
//! # Architecture
//!
//! Native model types are generally not `Send`, so the engine and the loaded
//! [`ModelResource`] live on a dedicated worker thread for the session's whole
//! lifetime. Control calls talk to it over a command channel.
//!
//! The session state sits behind a mutex that is only held for transitions,
//! never while tokens are being delivered. `load` and `unload` are additionally
//! serialized end to end by a lifecycle lock. Cancellation is one atomic flag
//! per generation, polled between token productions.

use std::fmt;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{InferenceError, InvalidStateError, LoadError, LoadErrorKind, SessionError};
use crate::inference::artifacts::ModelPath;
use crate::inference::engine::{InferenceEngine, ModelInfo};
use crate::inference::params::{unrecognized_keys, GenerationParams, ParameterValidator, RawParams};
use crate::inference::resource::ModelResource;
use crate::inference::streaming::{Token, TokenSink};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
    /// A stop was requested and the running generation has not yet observed it
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced its end-of-generation token (or ran out of context)
    EndOfSequence,
    /// `max_length` tokens were delivered
    MaxLength,
    /// `stop_generation` or `unload` cancelled it
    Cancelled,
}

/// Summary of a finished generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub generation_id: Uuid,
    /// False only when the generation was cancelled
    pub completed_normally: bool,
    /// Tokens delivered to the sink
    pub token_count: usize,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// A generation running on the worker
pub struct GenerationHandle {
    id: Uuid,
    response_rx: Receiver<Result<GenerationResult, SessionError>>,
}

impl GenerationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Blocks until the generation ends
    pub fn wait(self) -> Result<GenerationResult, SessionError> {
        match self.response_rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(InferenceError::Worker("worker exited before reporting a result".to_string()).into()),
        }
    }
}

struct GenerationJob {
    id: Uuid,
    prompt: String,
    params: GenerationParams,
    sink: Box<dyn TokenSink>,
    cancel: Arc<AtomicBool>,
    response_tx: Sender<Result<GenerationResult, SessionError>>,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Load {
        path: ModelPath,
        response_tx: Sender<Result<ModelInfo, LoadError>>,
    },
    Generate(GenerationJob),
    Unload {
        response_tx: Sender<()>,
    },
    Shutdown,
}

struct Inner {
    state: SessionState,
    model_info: Option<ModelInfo>,
    /// Cancellation flag of the running generation
    cancel: Option<Arc<AtomicBool>>,
    /// Set while `unload` is in progress; blocks new generations
    unloading: bool,
}

struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One loaded model and its current generation activity
pub struct GenerationSession {
    shared: Arc<Shared>,
    lifecycle: Mutex<()>,
    command_tx: Sender<WorkerCommand>,
    worker_handle: Option<JoinHandle<()>>,
    config: SessionConfig,
}

impl GenerationSession {
    /// Creates a session and spawns the worker thread that will own `engine`
    pub fn new<E: InferenceEngine>(engine: E, config: SessionConfig) -> Result<Self, InferenceError> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Unloaded,
                model_info: None,
                cancel: None,
                unloading: false,
            }),
        });

        let (command_tx, command_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("genai-worker".to_string())
            .spawn(move || worker_main(engine, command_rx, worker_shared))
            .map_err(|e| InferenceError::Worker(e.to_string()))?;

        tracing::info!("Generation worker thread started");

        Ok(Self {
            shared,
            lifecycle: Mutex::new(()),
            command_tx,
            worker_handle: Some(handle),
            config,
        })
    }

    /// Loads a model, blocking until native initialization finishes.
    ///
    /// Only valid when nothing is loaded; otherwise fails with
    /// [`LoadErrorKind::AlreadyLoaded`] and leaves the current model in place.
    pub fn load(&self, path: impl Into<ModelPath>) -> Result<ModelInfo, LoadError> {
        let path = path.into();
        let _lifecycle = self.lifecycle_lock();

        {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Unloaded {
                return Err(LoadError::new(
                    LoadErrorKind::AlreadyLoaded,
                    format!("session is {}", inner.state),
                ));
            }
            inner.state = SessionState::Loading;
        }

        tracing::info!("Loading model from {}", path);
        let (response_tx, response_rx) = mpsc::channel();
        let result = match self.command_tx.send(WorkerCommand::Load { path, response_tx }) {
            Ok(()) => response_rx.recv().unwrap_or_else(|_| Err(worker_unavailable())),
            Err(_) => Err(worker_unavailable()),
        };

        let mut inner = self.shared.lock();
        match &result {
            Ok(info) => {
                inner.state = SessionState::Ready;
                inner.model_info = Some(info.clone());
            }
            Err(e) => {
                tracing::error!("Failed to load model: {}", e);
                inner.state = SessionState::Unloaded;
                inner.model_info = None;
            }
        }
        result
    }

    /// Starts a generation and returns without waiting for it.
    ///
    /// Tokens go to `sink` on the worker thread. Fails with
    /// [`InvalidStateError`] unless the session is ready, and with a
    /// [`ValidationError`](crate::error::ValidationError) if `raw_params` is
    /// rejected; neither changes the session state.
    ///
    /// # Arguments
    /// * `prompt` - The input prompt text
    /// * `raw_params` - Generation parameters by name; unrecognized keys are ignored
    /// * `sink` - Receives every token of this generation, then the outcome
    ///
    /// # Returns
    /// * `Ok(GenerationHandle)` - Handle to wait on the running generation
    /// * `Err(SessionError)` - If the generation could not be started
    pub fn start_generation(
        &self,
        prompt: &str,
        raw_params: &RawParams,
        sink: impl TokenSink + 'static,
    ) -> Result<GenerationHandle, SessionError> {
        let mut inner = self.shared.lock();
        if inner.state != SessionState::Ready || inner.unloading {
            return Err(InvalidStateError::Session {
                operation: "generate",
                state: inner.state,
            }
            .into());
        }

        let context_window = inner
            .model_info
            .as_ref()
            .map(|info| info.context_window)
            .ok_or(InvalidStateError::Released)?;
        let validator = ParameterValidator::new(context_window, self.config.default_max_length);
        let params = validator.validate(raw_params)?;

        let ignored = unrecognized_keys(raw_params);
        if !ignored.is_empty() {
            tracing::debug!(?ignored, "Ignoring unrecognized generation parameters");
        }

        let id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let (response_tx, response_rx) = mpsc::channel();
        tracing::info!(
            generation_id = %id,
            prompt_len = prompt.len(),
            max_length = params.max_length,
            "Starting generation"
        );

        // Enqueued under the state lock so a later unload is always processed after it.
        let job = GenerationJob {
            id,
            prompt: prompt.to_string(),
            params,
            sink: Box::new(sink),
            cancel: Arc::clone(&cancel),
            response_tx,
        };
        if let Err(e) = self.command_tx.send(WorkerCommand::Generate(job)) {
            inner.state = SessionState::Unloaded;
            inner.model_info = None;
            return Err(InferenceError::Worker(e.to_string()).into());
        }

        inner.state = SessionState::Generating;
        inner.cancel = Some(cancel);
        Ok(GenerationHandle { id, response_rx })
    }

    /// Runs a generation to completion on the worker, blocking the caller
    pub fn generate(
        &self,
        prompt: &str,
        raw_params: &RawParams,
        sink: impl TokenSink + 'static,
    ) -> Result<GenerationResult, SessionError> {
        self.start_generation(prompt, raw_params, sink)?.wait()
    }

    /// Requests that the running generation stop.
    ///
    /// Does nothing unless a generation is running. The loop notices at the
    /// next token boundary, so at most one more token may be delivered.
    pub fn stop_generation(&self) {
        let mut inner = self.shared.lock();
        if inner.state != SessionState::Generating {
            return;
        }
        if let Some(cancel) = &inner.cancel {
            cancel.store(true, Ordering::SeqCst);
        }
        inner.state = SessionState::Stopping;
        tracing::info!("Generation stop requested");
    }

    /// Releases the model, stopping and waiting out any running generation first.
    ///
    /// Never fails; release errors are logged. A no-op when nothing is loaded.
    pub fn unload(&self) {
        let _lifecycle = self.lifecycle_lock();

        {
            let mut inner = self.shared.lock();
            match inner.state {
                SessionState::Unloaded => return,
                SessionState::Generating | SessionState::Stopping => {
                    if let Some(cancel) = &inner.cancel {
                        cancel.store(true, Ordering::SeqCst);
                    }
                    inner.state = SessionState::Stopping;
                    tracing::info!("Stopping generation before unload");
                }
                SessionState::Ready | SessionState::Loading => {}
            }
            inner.unloading = true;
        }

        let (response_tx, response_rx) = mpsc::channel();
        match self.command_tx.send(WorkerCommand::Unload { response_tx }) {
            Ok(()) => {
                if response_rx.recv().is_err() {
                    tracing::error!("Worker exited before confirming unload");
                }
            }
            Err(e) => tracing::error!("Failed to reach worker for unload: {}", e),
        }

        let mut inner = self.shared.lock();
        inner.state = SessionState::Unloaded;
        inner.model_info = None;
        inner.cancel = None;
        inner.unloading = false;
        tracing::info!("Model unloaded");
    }

    /// True while a model is held, whether idle or generating
    pub fn is_loaded(&self) -> bool {
        matches!(
            self.shared.lock().state,
            SessionState::Ready | SessionState::Generating | SessionState::Stopping
        )
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Information about the loaded model
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.shared.lock().model_info.clone()
    }

    fn lifecycle_lock(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for GenerationSession {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.lock().cancel.clone() {
            cancel.store(true, Ordering::SeqCst);
        }
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Generation worker panicked during shutdown");
            }
        }
    }
}

fn worker_unavailable() -> LoadError {
    LoadError::new(LoadErrorKind::CorruptArtifacts, "generation worker is unavailable")
}

/// Worker thread main loop
///
/// Owns the engine and the model; processes commands until shutdown.
fn worker_main<E: InferenceEngine>(mut engine: E, command_rx: Receiver<WorkerCommand>, shared: Arc<Shared>) {
    let mut resource = ModelResource::empty();

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load { path, response_tx }) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    resource.acquire(&mut engine, &path).cloned()
                }))
                .unwrap_or_else(|_| {
                    Err(LoadError::new(LoadErrorKind::CorruptArtifacts, "model loader panicked"))
                });
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Generate(job)) => run_job(&mut engine, &mut resource, job, &shared),
            Ok(WorkerCommand::Unload { response_tx }) => {
                resource.release(&mut engine);
                let _ = response_tx.send(());
            }
            Ok(WorkerCommand::Shutdown) => {
                resource.release(&mut engine);
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                resource.release(&mut engine);
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn run_job<E: InferenceEngine>(
    engine: &mut E,
    resource: &mut ModelResource<E::Model>,
    job: GenerationJob,
    shared: &Shared,
) {
    let GenerationJob {
        id,
        prompt,
        params,
        mut sink,
        cancel,
        response_tx,
    } = job;
    let started_at = Utc::now();
    let started = Instant::now();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        decode_loop(engine, resource, &prompt, &params, sink.as_mut(), &cancel)
    }))
    .unwrap_or_else(|_| Err(InferenceError::Worker("generation panicked".to_string()).into()))
    .map(|(token_count, stop_reason)| GenerationResult {
        generation_id: id,
        completed_normally: stop_reason != StopReason::Cancelled,
        token_count,
        stop_reason,
        started_at,
        elapsed: started.elapsed(),
    });

    match &outcome {
        Ok(result) => tracing::info!(
            generation_id = %id,
            tokens = result.token_count,
            reason = ?result.stop_reason,
            "Generation finished in {:.2?}",
            result.elapsed
        ),
        Err(e) => tracing::error!(generation_id = %id, "Generation failed: {}", e),
    }

    if panic::catch_unwind(AssertUnwindSafe(|| sink.finish(&outcome))).is_err() {
        tracing::error!(generation_id = %id, "Token sink panicked in finish");
    }

    {
        let mut inner = shared.lock();
        if matches!(inner.state, SessionState::Generating | SessionState::Stopping) {
            if resource.is_held() {
                inner.state = SessionState::Ready;
            } else {
                inner.state = SessionState::Unloaded;
                inner.model_info = None;
            }
        }
        inner.cancel = None;
    }

    let _ = response_tx.send(outcome);
}

/// Runs the engine, delivering pieces to `sink` and enforcing `max_length`
/// and cancellation. Returns the number of delivered tokens.
fn decode_loop<E: InferenceEngine>(
    engine: &mut E,
    resource: &mut ModelResource<E::Model>,
    prompt: &str,
    params: &GenerationParams,
    sink: &mut dyn TokenSink,
    cancel: &AtomicBool,
) -> Result<(usize, StopReason), SessionError> {
    if cancel.load(Ordering::SeqCst) {
        return Ok((0, StopReason::Cancelled));
    }

    let model = resource.model_mut()?;
    let max_length = params.max_length as usize;
    let mut delivered = 0usize;
    let mut stop_reason = StopReason::EndOfSequence;

    engine.generate(model, prompt, params, &mut |piece: &str| {
        if cancel.load(Ordering::SeqCst) {
            stop_reason = StopReason::Cancelled;
            return ControlFlow::Break(());
        }

        sink.deliver(Token {
            index: delivered,
            text: piece.to_string(),
        });
        delivered += 1;

        if delivered >= max_length {
            stop_reason = StopReason::MaxLength;
            return ControlFlow::Break(());
        }
        if cancel.load(Ordering::SeqCst) {
            stop_reason = StopReason::Cancelled;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    })?;

    Ok((delivered, stop_reason))
}
