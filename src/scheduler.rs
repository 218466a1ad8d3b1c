use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{Notify, watch};

use crate::error::{RagError, RagResult};
use crate::retrieval::Tags;

/// Higher values are served first.
pub type Priority = u8;

/// Lowest valid priority. Priorities are positive.
pub const MIN_PRIORITY: Priority = 1;

pub const DEFAULT_PRIORITY: Priority = MIN_PRIORITY;

/// Scheduler-assigned request id, strictly increasing from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "REQ_{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: RequestId,
    pub query: String,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub metadata: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

impl SchedulerState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub timestamp: DateTime<Utc>,
}

/// Processes one dequeued request. Errors and panics are contained per request.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> anyhow::Result<()>;
}

/// Heap entry. The max-heap pops the highest priority first, then the earliest
/// timestamp, then the lowest id (ids follow submission order).
struct Queued(Request);

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.submitted_at.cmp(&self.0.submitted_at))
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Queued {}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Queued>,
    last_id: u64,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Notify,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Request> {
        self.queue().heap.pop().map(|Queued(request)| request)
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    exited: watch::Receiver<bool>,
}

struct Control {
    state: SchedulerState,
    worker: Option<Worker>,
}

fn lock_control(control: &Mutex<Control>) -> MutexGuard<'_, Control> {
    control.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned by the consumer task. Returns the scheduler to `Idle` and releases
/// every `stop()` waiter when the task ends, however it ends.
struct ExitGuard {
    control: Arc<Mutex<Control>>,
    exited: watch::Sender<bool>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        {
            let mut control = lock_control(&self.control);
            control.state = SchedulerState::Idle;
            control.worker = None;
        }
        self.exited.send_replace(true);
        tracing::info!("Request processing stopped");
    }
}

/// Priority queue drained by a single background consumer.
pub struct RequestScheduler {
    shared: Arc<Shared>,
    control: Arc<Mutex<Control>>,
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            control: Arc::new(Mutex::new(Control {
                state: SchedulerState::Idle,
                worker: None,
            })),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        lock_control(&self.control)
    }

    /// Enqueue a request and return its id. Never waits on processing.
    ///
    /// Id assignment, timestamping and insertion happen under one lock, so ids
    /// are unique and gap-free even under concurrent submission. A priority of
    /// 0 is raised to [`MIN_PRIORITY`].
    pub fn submit(&self, query: impl Into<String>, priority: Priority, metadata: Tags) -> RequestId {
        if priority < MIN_PRIORITY {
            tracing::warn!(priority, "Priority below minimum, using {}", MIN_PRIORITY);
        }
        let priority = priority.max(MIN_PRIORITY);

        let id = {
            let mut queue = self.shared.queue();
            queue.last_id += 1;
            let id = RequestId(queue.last_id);
            queue.heap.push(Queued(Request {
                id,
                query: query.into(),
                priority,
                submitted_at: Utc::now(),
                metadata,
            }));
            id
        };
        self.shared.wakeup.notify_one();

        tracing::info!(request_id = %id, priority, "Request queued");
        id
    }

    /// Read-only snapshot of the queue.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_size: self.shared.queue().heap.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.control().state
    }

    /// Spawn the single consumer. Must be called from within a Tokio runtime.
    pub fn start(&self, handler: Arc<dyn RequestHandler>) -> RagResult<()> {
        let mut control = self.control();
        if control.state != SchedulerState::Idle {
            return Err(RagError::SchedulerRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (exited_tx, exited) = watch::channel(false);
        let guard = ExitGuard {
            control: self.control.clone(),
            exited: exited_tx,
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _guard = guard;
            consume(shared, handler, shutdown_rx).await;
        });

        control.worker = Some(Worker { shutdown, exited });
        control.state = SchedulerState::Running;
        tracing::info!("Request processing started");
        Ok(())
    }

    /// Ask the consumer to exit after its current request and wait until it has.
    ///
    /// Requests still queued stay queued. Every concurrent caller waits for the
    /// same exit. Dropping the returned future does not cancel the shutdown: the
    /// consumer still exits and the scheduler still returns to `Idle`. A no-op
    /// when idle.
    pub async fn stop(&self) {
        let mut exited = {
            let mut control = self.control();
            if control.state == SchedulerState::Running {
                control.state = SchedulerState::Stopping;
                if let Some(worker) = &control.worker {
                    let _ = worker.shutdown.send(true);
                }
            }
            match &control.worker {
                Some(worker) => worker.exited.clone(),
                None => return,
            }
        };

        // An error means the guard already dropped its sender, after marking exit.
        let _ = exited.wait_for(|done| *done).await;
    }
}

async fn consume(
    shared: Arc<Shared>,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match shared.pop() {
            Some(request) => run_handler(handler.as_ref(), request).await,
            None => {
                tokio::select! {
                    _ = shared.wakeup.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("Request consumer exited");
}

async fn run_handler(handler: &dyn RequestHandler, request: Request) {
    let request_id = request.id;
    let started = Instant::now();
    tracing::info!(request_id = %request_id, priority = request.priority, "Processing request");

    let fault = match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(RagError::HandlerFault(format!("{e:#}"))),
        Err(panic) => Some(RagError::HandlerFault(panic_message(panic.as_ref()))),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match fault {
        None => tracing::info!(request_id = %request_id, elapsed_ms, "Request processed"),
        Some(err) => tracing::error!(
            request_id = %request_id,
            elapsed_ms,
            error = %err,
            "Request failed, continuing with next"
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
