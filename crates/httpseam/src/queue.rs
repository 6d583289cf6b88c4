//! Execution contexts for observer delivery

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use tokio::{runtime::Handle, sync::mpsc};
use tracing::warn;

use crate::{
    config::DeliveryMode,
    error::{HttpError, Result},
};

/// A unit of observer work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs observer jobs somewhere
pub trait Executor: Send + Sync {
    /// Run or schedule `job`
    fn execute(&self, job: Job);
}

/// Cheaply cloneable handle to an [`Executor`]
#[derive(Clone)]
pub struct DeliveryQueue {
    label: Arc<str>,
    executor: Arc<dyn Executor>,
}

impl DeliveryQueue {
    /// Run jobs on the thread that produced the event
    pub fn inline() -> Self {
        Self {
            label: Arc::from("inline"),
            executor: Arc::new(Inline),
        }
    }

    /// Run jobs one at a time, in submission order, on a dedicated thread
    pub fn serial(label: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let name = label.to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!(queue = %name, "Observer panicked");
                    }
                }
            })
            .map_err(|e| HttpError::BuildError(format!("cannot start delivery queue: {e}")))?;

        Ok(Self {
            label: Arc::from(label),
            executor: Arc::new(Serial { tx }),
        })
    }

    /// Spawn each job onto a Tokio runtime
    pub fn runtime(handle: Handle) -> Self {
        Self {
            label: Arc::from("runtime"),
            executor: Arc::new(Runtime(handle)),
        }
    }

    /// Wrap a caller-supplied executor
    pub fn custom(label: &str, executor: Arc<dyn Executor>) -> Self {
        Self {
            label: Arc::from(label),
            executor,
        }
    }

    /// Build the queue named by a [`DeliveryMode`]
    pub fn for_mode(mode: DeliveryMode) -> Result<Self> {
        match mode {
            DeliveryMode::Inline => Ok(Self::inline()),
            DeliveryMode::Serial => Self::serial("httpseam-delivery"),
            DeliveryMode::Runtime => Handle::try_current().map(Self::runtime).map_err(|_| {
                HttpError::BuildError("runtime delivery requires a Tokio runtime".to_string())
            }),
        }
    }

    /// Queue label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Submit a job
    pub fn execute(&self, job: Job) {
        self.executor.execute(job);
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

struct Inline;

impl Executor for Inline {
    fn execute(&self, job: Job) {
        job();
    }
}

struct Serial {
    tx: mpsc::UnboundedSender<Job>,
}

impl Executor for Serial {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!("Delivery queue worker has stopped; dropping observer job");
        }
    }
}

struct Runtime(Handle);

impl Executor for Runtime {
    fn execute(&self, job: Job) {
        self.0.spawn(async move { job() });
    }
}
