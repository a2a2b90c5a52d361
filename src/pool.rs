use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, error};

use crate::cancel::{CancelToken, JobContext};
use crate::errors::AgentError;
use crate::metrics;

/// Terminal outcome of one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed,
    Panic,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Panic => "panic",
        }
    }
}

pub type Handler<T> = dyn Fn(&JobContext, &T) -> Result<(), AgentError> + Send + Sync;
/// Decides whether to retry after a failed attempt. Receives the 0-based
/// count of completed attempts and returns the backoff to sleep, or None
/// for a terminal failure.
pub type RetryPolicy<T> = dyn Fn(&T, &AgentError, u32) -> Option<Duration> + Send + Sync;
pub type PanicHandler<T> = dyn Fn(&T, &str) + Send + Sync;
/// Called exactly once per job with the terminal status, the total
/// duration, the number of attempts and the last error if any.
pub type AfterHook<T> = dyn Fn(&T, JobStatus, Duration, u32, Option<&AgentError>) + Send + Sync;

pub struct WorkerPoolBuilder<T> {
    name: String,
    workers: usize,
    queue_capacity: usize,
    job_timeout: Option<Duration>,
    retry_policy: Option<Arc<RetryPolicy<T>>>,
    panic_handler: Option<Arc<PanicHandler<T>>>,
    after_hook: Option<Arc<AfterHook<T>>>,
}

impl<T: Send + 'static> WorkerPoolBuilder<T> {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            name: name.into(),
            workers,
            queue_capacity: workers,
            job_timeout: None,
            retry_policy: None,
            panic_handler: None,
            after_hook: None,
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(self.workers);
        self
    }

    /// Deadline applied to every handler attempt through its JobContext.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn retry_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&T, &AgentError, u32) -> Option<Duration> + Send + Sync + 'static,
    {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&T, &str) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    pub fn after_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T, JobStatus, Duration, u32, Option<&AgentError>) + Send + Sync + 'static,
    {
        self.after_hook = Some(Arc::new(hook));
        self
    }

    pub fn spawn<F>(self, cancel: CancelToken, handler: F) -> WorkerPool<T>
    where
        F: Fn(&JobContext, &T) -> Result<(), AgentError> + Send + Sync + 'static,
    {
        let (tx, rx) = bounded::<T>(self.queue_capacity);
        let shared = Arc::new(WorkerShared {
            name: self.name,
            job_timeout: self.job_timeout,
            handler: Arc::new(handler),
            retry_policy: self.retry_policy,
            panic_handler: self.panic_handler,
            after_hook: self.after_hook,
            cancel,
        });

        let mut handles = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let rx = rx.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", shared.name, i))
                .spawn(move || worker_loop(rx, shared))
                .expect("unable to spawn pool worker");
            handles.push(handle);
        }

        WorkerPool {
            name: shared.name.clone(),
            tx: Some(tx),
            handles,
        }
    }
}

struct WorkerShared<T> {
    name: String,
    job_timeout: Option<Duration>,
    handler: Arc<Handler<T>>,
    retry_policy: Option<Arc<RetryPolicy<T>>>,
    panic_handler: Option<Arc<PanicHandler<T>>>,
    after_hook: Option<Arc<AfterHook<T>>>,
    cancel: CancelToken,
}

/// Bounded worker pool with typed retry, panic isolation and an exactly
/// once terminal after-hook per job.
pub struct WorkerPool<T> {
    name: String,
    tx: Option<Sender<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Enqueues one job. Blocks when the queue is full.
    pub fn submit(&self, job: T) {
        metrics::metrics()
            .pool_queue_depth
            .with_label_values(&[self.name.as_str()])
            .inc();
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                metrics::metrics()
                    .pool_queue_depth
                    .with_label_values(&[self.name.as_str()])
                    .dec();
                error!("pool {} rejected a job, channel closed", self.name);
            }
        }
    }

    /// Closes the job channel and waits for the workers to drain. Every
    /// submitted job has reached its after-hook when this returns.
    pub fn stop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("pool {} worker thread aborted", self.name);
            }
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T>(rx: Receiver<T>, shared: Arc<WorkerShared<T>>) {
    let m = metrics::metrics();
    while let Ok(job) = rx.recv() {
        m.pool_queue_depth.with_label_values(&[shared.name.as_str()]).dec();
        m.pool_active_workers.with_label_values(&[shared.name.as_str()]).inc();

        let start = Instant::now();
        let mut attempt: u32 = 0;
        let (status, last_error) = loop {
            let ctx = match shared.job_timeout {
                Some(timeout) => JobContext::with_timeout(shared.cancel.clone(), timeout),
                None => JobContext::unbounded(shared.cancel.clone()),
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| (shared.handler)(&ctx, &job)));
            match outcome {
                Err(payload) => {
                    m.pool_panics_total.with_label_values(&[shared.name.as_str()]).inc();
                    let message = panic_message(payload.as_ref());
                    error!("pool {} job panicked: {}", shared.name, message);
                    if let Some(handler) = &shared.panic_handler {
                        handler(&job, &message);
                    }
                    break (JobStatus::Panic, None);
                }
                Ok(Ok(())) => break (JobStatus::Success, None),
                Ok(Err(err)) => {
                    if shared.cancel.is_cancelled() {
                        break (JobStatus::Failed, Some(err));
                    }
                    let backoff = shared
                        .retry_policy
                        .as_ref()
                        .and_then(|policy| policy(&job, &err, attempt));
                    match backoff {
                        Some(backoff) => {
                            m.pool_retries_total.with_label_values(&[shared.name.as_str()]).inc();
                            debug!(
                                "pool {} retrying after {:?} (attempt {}): {}",
                                shared.name, backoff, attempt, err
                            );
                            if !shared.cancel.sleep(backoff) {
                                break (JobStatus::Failed, Some(err));
                            }
                            attempt += 1;
                        }
                        None => break (JobStatus::Failed, Some(err)),
                    }
                }
            }
        };

        let duration = start.elapsed();
        m.pool_task_duration_seconds
            .with_label_values(&[shared.name.as_str(), status.as_str()])
            .observe(duration.as_secs_f64());
        if let Some(hook) = &shared.after_hook {
            hook(&job, status, duration, attempt + 1, last_error.as_ref());
        }
        m.pool_active_workers.with_label_values(&[shared.name.as_str()]).dec();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
