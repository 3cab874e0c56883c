//! Execution contexts hosted on dedicated OS threads.
//!
//! Script engines keep thread-affine state, so each pooled context is a thread
//! that owns one runtime and serves commands sent through its handle. The
//! thread holds the context's pool slot until it exits, so a discarded worker
//! still unwinding a runaway script keeps counting against the pool bound.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::Instant,
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::application::render::{
    CancelSignal, ContextFactory, ContextJob, DATA_GLOBAL, ExecutionContext, HEAD_GLOBAL,
    JobContext, JobReport, RenderError, ScriptRuntime, SlotLease, panic_message,
    render_in_context,
};

/// Builds the runtime a worker thread owns. Called on that thread.
pub trait RuntimeLoader: Send + Sync + 'static {
    type Runtime: ScriptRuntime;

    fn load(&self) -> Result<Self::Runtime, RenderError>;
}

enum Command {
    Render {
        job: ContextJob,
        reply: oneshot::Sender<JobReport>,
    },
    Reset,
    Shutdown,
}

/// Handle to one engine worker thread.
pub struct EngineWorker {
    id: u64,
    commands: mpsc::Sender<Command>,
    interrupted: Arc<AtomicBool>,
}

impl ExecutionContext for EngineWorker {
    fn id(&self) -> u64 {
        self.id
    }

    fn reset(&mut self) {
        self.interrupted.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Reset);
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn dispose(self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl JobContext for EngineWorker {
    fn cancel_signal(&self, deadline: Instant) -> CancelSignal {
        CancelSignal::new(deadline, Arc::clone(&self.interrupted))
    }

    fn submit(&self, job: ContextJob) -> oneshot::Receiver<JobReport> {
        let (reply, receiver) = oneshot::channel();
        if self.commands.send(Command::Render { job, reply }).is_err() {
            debug!(
                target = "ssrd::engine::worker",
                worker_id = self.id,
                "engine worker already exited"
            );
        }
        receiver
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        // Unblocks a job still polling; the thread exits once the channel closes.
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

/// [`ContextFactory`] that spawns one worker thread per context.
pub struct WorkerFactory<L: RuntimeLoader> {
    loader: Arc<L>,
    next_id: AtomicU64,
}

impl<L: RuntimeLoader> WorkerFactory<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<L: RuntimeLoader> ContextFactory for WorkerFactory<L> {
    type Context = EngineWorker;

    fn create(&self, lease: SlotLease) -> Result<EngineWorker, RenderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let loader = Arc::clone(&self.loader);

        thread::Builder::new()
            .name(format!("ssrd-engine-{id}"))
            .spawn(move || {
                let _lease = lease;
                let runtime = match loader.load() {
                    Ok(runtime) => {
                        let _ = ready_tx.send(Ok(()));
                        runtime
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                serve(id, runtime, inbox);
            })
            .map_err(|err| {
                RenderError::context_init(format!("failed to spawn engine worker: {err}"))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(EngineWorker {
                id,
                commands,
                interrupted: Arc::new(AtomicBool::new(false)),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RenderError::context_init(
                "engine worker exited during startup",
            )),
        }
    }
}

fn serve<R: ScriptRuntime>(id: u64, mut runtime: R, inbox: mpsc::Receiver<Command>) {
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Render { job, reply } => {
                let report = run_job(&mut runtime, &job);
                let reusable = report.reusable;
                let _ = reply.send(report);
                if !reusable {
                    break;
                }
            }
            Command::Reset => {
                let cleared = runtime
                    .clear_global(DATA_GLOBAL)
                    .and_then(|()| runtime.clear_global(HEAD_GLOBAL));
                if let Err(err) = cleared {
                    warn!(
                        target = "ssrd::engine::worker",
                        worker_id = id,
                        error = %err,
                        "failed to clear request globals"
                    );
                    break;
                }
            }
            Command::Shutdown => break,
        }
    }
    debug!(target = "ssrd::engine::worker", worker_id = id, "engine worker exited");
}

fn run_job<R: ScriptRuntime>(runtime: &mut R, job: &ContextJob) -> JobReport {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        render_in_context(runtime, &job.input, &job.signal)
    }));

    match outcome {
        Ok(result) => {
            let reusable =
                !job.signal.is_cancelled() && !matches!(result, Err(RenderError::Cancelled));
            JobReport { result, reusable }
        }
        Err(panic) => JobReport {
            result: Err(RenderError::engine_fault(format!(
                "engine worker panicked: {}",
                panic_message(panic.as_ref())
            ))),
            reusable: false,
        },
    }
}
