//! Inference service owning the model context
//!
//! One process-wide service holds the loaded context behind a
//! [`SingleFlight`] guard. Each accepted request runs on its own named
//! thread and streams tokens through a [`DeliveryChannel`]; a request that
//! arrives while another run holds the context is rejected immediately.

use crate::{
    backend::{ModelContext, ModelLoader},
    config::ServiceConfig,
    generation::{DecodeRun, RunOptions, RunSummary, SamplingParams},
    guard::{RunPermit, SingleFlight},
    stream::{DeliveryChannel, StreamEvent, TokenSink},
    CoreError, Result, RunError,
};
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

/// Main inference service: loaded context plus run bookkeeping
pub struct InferenceService<C: ModelContext> {
    /// Model context, reachable only through a permit
    context: SingleFlight<C>,
    /// Service configuration
    config: ServiceConfig,
    /// Runs whose thread has not finished delivering yet
    active: Arc<ActiveRuns>,
}

impl<C: ModelContext> InferenceService<C> {
    /// Load the model (and adapter, if configured) and build the service.
    ///
    /// On failure the host reports `status_code() == 1`.
    pub fn initialize<L>(loader: &L, config: ServiceConfig) -> Result<Self>
    where
        L: ModelLoader<Context = C>,
    {
        config.validate()?;

        info!(
            model = %config.model.model.display(),
            lora = ?config.model.lora,
            use_mmap = config.model.effective_use_mmap(),
            n_threads = config.n_threads,
            "loading model"
        );

        let context = loader.load(&config.model).map_err(|err| {
            error!(code = err.code(), "failed to load model: {}", err);
            err
        })?;

        info!(
            n_ctx = context.n_ctx(),
            n_vocab = context.n_vocab(),
            "model loaded"
        );
        Self::from_context(context, config)
    }

    /// Wrap an already loaded context
    pub fn from_context(context: C, config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            context: SingleFlight::new(context),
            config,
            active: Arc::new(ActiveRuns::default()),
        })
    }

    /// Get service configuration
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start a run with the configured sampling parameters.
    ///
    /// Returns `false` without side effects when another run holds the
    /// context, or when the run thread could not be started.
    pub fn start<S: TokenSink>(&self, prompt: &str, sink: S) -> bool {
        match self.spawn(prompt, sink) {
            // Detached; `shutdown` still waits for it.
            Ok(Some(_handle)) => true,
            Ok(None) => {
                debug!("run rejected: context busy");
                false
            }
            Err(err) => {
                error!(code = err.code(), "failed to start run: {}", err);
                false
            }
        }
    }

    /// Like [`start`](Self::start) but hands back the run handle
    pub fn spawn<S: TokenSink>(&self, prompt: &str, sink: S) -> Result<Option<RunHandle>> {
        self.spawn_with(prompt, self.config.sampling.clone(), sink)
    }

    /// Start a run with per-request sampling parameters.
    ///
    /// `Ok(None)` means the context is busy.
    pub fn spawn_with<S: TokenSink>(
        &self,
        prompt: &str,
        params: SamplingParams,
        sink: S,
    ) -> Result<Option<RunHandle>> {
        params.validate()?;

        let permit = match self.context.try_acquire() {
            Some(permit) => permit,
            None => return Ok(None),
        };

        let channel = DeliveryChannel::open(sink)?;
        let id = Uuid::new_v4();
        let options = RunOptions {
            n_threads: self.config.n_threads,
            echo_prompt: self.config.echo_prompt,
        };
        let prompt = prompt.to_string();

        let span = info_span!("run", %id);
        let active = self.active.enter();
        let thread = std::thread::Builder::new()
            .name("spindle-run".to_string())
            .spawn(move || {
                let _enter = span.enter();
                let _active = active;
                run_to_completion(permit, channel, &prompt, params, options)
            })
            .map_err(|err| CoreError::Io {
                code: "RUN_SPAWN_FAILED",
                message: err.to_string(),
                path: None,
                suggestion: "The system may be out of threads; retry later".to_string(),
                source: err,
            })?;

        debug!(%id, "run started");
        Ok(Some(RunHandle { id, thread }))
    }

    /// Apply a new adapter, waiting for any in-flight run to finish first.
    ///
    /// Blocks the calling thread; do not call it from inside an async
    /// runtime or from a token sink.
    pub fn swap_adapter(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut context = self.context.acquire_blocking();

        info!(adapter = %path.display(), "applying adapter");
        context.apply_adapter(path, self.config.n_threads).map_err(|err| {
            error!(code = err.code(), adapter = %path.display(), "failed to apply adapter: {}", err);
            err
        })
    }

    /// Whether a run currently holds the context
    pub fn is_busy(&self) -> bool {
        self.context.is_held()
    }

    /// Number of runs still generating or delivering
    pub fn active_runs(&self) -> usize {
        *self.active.count.lock()
    }

    /// Wait until every run finished delivering to its sink, then release
    /// the context
    pub fn shutdown(self) -> C {
        let pending = self.active_runs();
        if pending > 0 {
            debug!(pending, "waiting for runs before shutdown");
        }
        self.active.wait_idle();
        info!("service shut down");
        self.context.into_inner()
    }
}

/// Count of run threads that have not finished delivering
#[derive(Default)]
struct ActiveRuns {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveRuns {
    fn enter(self: &Arc<Self>) -> ActiveRun {
        *self.count.lock() += 1;
        ActiveRun(Arc::clone(self))
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Held by a run thread until its delivery channel is closed
struct ActiveRun(Arc<ActiveRuns>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Body of a run thread.
///
/// The permit is released before the failure event is queued, so a sink
/// reacting to it can start the next run.
fn run_to_completion<C: ModelContext>(
    mut permit: RunPermit<C>,
    channel: DeliveryChannel,
    prompt: &str,
    params: SamplingParams,
    options: RunOptions,
) -> std::result::Result<RunSummary, RunError> {
    let outcome = DecodeRun::prepare(&mut *permit, prompt, params, options).and_then(|run| {
        run.run(|event| {
            channel.emit(event);
        })
    });
    drop(permit);

    match &outcome {
        Ok(summary) => info!(
            finish_reason = ?summary.finish_reason,
            tokens_generated = summary.tokens_generated,
            tokens_per_second = summary.stats.tokens_per_second,
            "run complete"
        ),
        Err(err) => {
            error!(code = err.code(), "run failed: {}", err);
            channel.emit(StreamEvent::Failed(err.clone()));
        }
    }

    let delivered = channel.close();
    debug!(delivered, "delivery closed");
    outcome
}

/// Handle to a run thread
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    thread: JoinHandle<std::result::Result<RunSummary, RunError>>,
}

impl RunHandle {
    /// Identifier attached to the run's log span
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the run thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run and for the sink to receive every event
    pub fn join(self) -> Result<RunSummary> {
        match self.thread.join() {
            Ok(outcome) => outcome.map_err(CoreError::from),
            Err(_) => Err(CoreError::Internal {
                code: "RUN_THREAD_PANICKED",
                message: format!("run {} panicked", self.id),
                context: "Joining the generation thread".to_string(),
                source: None,
            }),
        }
    }
}
