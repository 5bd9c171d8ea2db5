//! A fiber: a parked OS thread with its own stack that runs one job at a time.
//!
//! The driving worker and the fiber thread hand control back and forth over a
//! pair of channels, so exactly one of them is running at any moment:
//!
//! ```text
//! worker                      fiber thread
//!   │── Run { job } ─────────────▶│ job()
//!   │                             │   park() ─┐
//!   │◀──────────── Parked(task) ──│◀──────────┘
//!   │ (runs other work)           │ (blocked)
//!   │── Resume ──────────────────▶│   ...
//!   │◀──────────────── Finished ──│
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use crate::errors::{PipeError, PipeResult};
use crate::runtime::WorkerRef;
use crate::suspend::TaskCell;

use super::context::{self, FiberExit, FiberLink};

/// Unit of work run on a fiber.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum FiberCommand {
    Run { job: Job, worker: WorkerRef },
    Resume { worker: WorkerRef },
    Exit,
}

pub(crate) enum FiberEvent {
    /// The job returned (or panicked) and the fiber is idle again.
    Finished { panicked: bool },
    /// The job parked on this task; the fiber now belongs to it.
    Parked(Arc<TaskCell>),
}

/// Reusable execution context backing one runnable task.
pub struct Fiber {
    id: u64,
    commands: Sender<FiberCommand>,
    events: Receiver<FiberEvent>,
    thread: Option<JoinHandle<()>>,
    /// Run by the worker once the fiber is back in a pool.
    after_release: Option<Job>,
}

impl Fiber {
    pub(crate) fn spawn(id: u64, stack_size: usize) -> PipeResult<Self> {
        let (command_tx, command_rx) = channel::bounded(1);
        let (event_tx, event_rx) = channel::bounded(1);

        let thread = std::thread::Builder::new()
            .name(format!("pipewhile-fiber-{id}"))
            .stack_size(stack_size)
            .spawn(move || fiber_main(id, command_rx, event_tx))
            .map_err(|e| {
                PipeError::ResourceExhausted(format!("failed to spawn fiber thread {id}: {e}"))
            })?;

        Ok(Self {
            id,
            commands: command_tx,
            events: event_rx,
            thread: Some(thread),
            after_release: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_after_release(&mut self, hook: Option<Job>) {
        self.after_release = hook;
    }

    pub(crate) fn take_after_release(&mut self) -> Option<Job> {
        self.after_release.take()
    }

    pub(crate) fn start(&self, job: Job, worker: WorkerRef) -> PipeResult<()> {
        self.send(FiberCommand::Run { job, worker })
    }

    pub(crate) fn resume(&self, worker: WorkerRef) -> PipeResult<()> {
        self.send(FiberCommand::Resume { worker })
    }

    /// Block until the fiber finishes its job or parks.
    pub(crate) fn wait(&self) -> PipeResult<FiberEvent> {
        self.events
            .recv()
            .map_err(|_| PipeError::Internal(format!("fiber {} exited unexpectedly", self.id)))
    }

    fn send(&self, command: FiberCommand) -> PipeResult<()> {
        self.commands
            .send(command)
            .map_err(|_| PipeError::Internal(format!("fiber {} is gone", self.id)))
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let _ = self.commands.send(FiberCommand::Exit);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::warn!(fiber = self.id, "fiber thread panicked during exit");
            }
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id).finish()
    }
}

fn fiber_main(id: u64, commands: Receiver<FiberCommand>, events: Sender<FiberEvent>) {
    context::install_link(FiberLink {
        commands: commands.clone(),
        events: events.clone(),
    });

    while let Ok(command) = commands.recv() {
        match command {
            FiberCommand::Run { job, worker } => {
                context::set_worker(Some(worker));
                let outcome = panic::catch_unwind(AssertUnwindSafe(job));
                context::set_worker(None);

                let panicked = match outcome {
                    Ok(()) => false,
                    Err(payload) if payload.is::<FiberExit>() => break,
                    Err(payload) => {
                        let error = PipeError::from_panic(payload);
                        tracing::error!(fiber = id, error = %error, "job panicked on fiber");
                        true
                    }
                };

                if events.send(FiberEvent::Finished { panicked }).is_err() {
                    break;
                }
            }
            FiberCommand::Resume { .. } => {
                tracing::error!(fiber = id, "resume delivered to an idle fiber");
            }
            FiberCommand::Exit => break,
        }
    }

    context::clear();
    tracing::trace!(fiber = id, "fiber exited");
}
