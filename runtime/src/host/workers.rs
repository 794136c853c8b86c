//! Background worker pool for embed post-processing.
//!
//! Tasks carry a correlation id and their results are posted back on a
//! channel. The lifecycle manager takes the receiving end and applies each
//! result as it arrives; without a consumer the results stay queued for
//! [`WorkerPool::drain`]. When the pool cannot start (zero workers or no
//! tokio runtime) every task runs inline on submit and the result is posted
//! the same way.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Estimated compressed size as a fraction of the input.
pub const COMPRESSION_RATIO: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerTask {
    Render { embed_id: String, html: String },
    /// Count interaction event types.
    Aggregate { embed_id: String, events: Vec<String> },
    Compress { embed_id: String, bytes: usize },
}

impl WorkerTask {
    pub fn embed_id(&self) -> &str {
        match self {
            Self::Render { embed_id, .. }
            | Self::Aggregate { embed_id, .. }
            | Self::Compress { embed_id, .. } => embed_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerOutput {
    Rendered { html: String },
    Aggregated { counts: BTreeMap<String, usize> },
    Compressed { estimated_bytes: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub id: u64,
    pub embed_id: String,
    pub output: WorkerOutput,
}

/// Run one task.
pub fn execute(task: WorkerTask) -> WorkerOutput {
    match task {
        WorkerTask::Render { html, .. } => WorkerOutput::Rendered {
            html: html.trim().to_string(),
        },
        WorkerTask::Aggregate { events, .. } => {
            let mut counts = BTreeMap::new();
            for event in events {
                *counts.entry(event).or_insert(0) += 1;
            }
            WorkerOutput::Aggregated { counts }
        }
        WorkerTask::Compress { bytes, .. } => WorkerOutput::Compressed {
            estimated_bytes: (bytes as f64 * COMPRESSION_RATIO).round() as usize,
        },
    }
}

type TaskQueue = mpsc::UnboundedReceiver<(u64, WorkerTask)>;

pub struct WorkerPool {
    tasks: Mutex<Option<mpsc::UnboundedSender<(u64, WorkerTask)>>>,
    results_tx: mpsc::UnboundedSender<WorkerResult>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerResult>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerPool {
    /// Start `size` workers, or an inline executor when that is not possible.
    pub fn start(size: usize) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let runtime = tokio::runtime::Handle::try_current().ok();
        let (tasks, handles) = match runtime {
            Some(handle) if size > 0 => {
                let (tx, rx) = mpsc::unbounded_channel();
                let rx: Arc<tokio::sync::Mutex<TaskQueue>> =
                    Arc::new(tokio::sync::Mutex::new(rx));
                let handles = (0..size)
                    .map(|_| {
                        handle.spawn(run_worker(
                            Arc::clone(&rx),
                            results_tx.clone(),
                            Arc::clone(&in_flight),
                            Arc::clone(&idle),
                        ))
                    })
                    .collect();
                tracing::debug!("worker pool started with {size} workers");
                (Some(tx), handles)
            }
            _ => {
                tracing::debug!("worker pool unavailable, executing tasks inline");
                (None, Vec::new())
            }
        };

        Self {
            tasks: Mutex::new(tasks),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            handles: Mutex::new(handles),
            next_id: AtomicU64::new(1),
            in_flight,
            idle,
        }
    }

    /// Whether tasks run on background workers.
    pub fn is_offloaded(&self) -> bool {
        self.tasks.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Submit a task, returning its correlation id.
    pub fn submit(&self, task: WorkerTask) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = match self.tasks.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    match tx.send((id, task)) {
                        Ok(()) => return id,
                        Err(mpsc::error::SendError((_, task))) => {
                            self.in_flight.fetch_sub(1, Ordering::SeqCst);
                            task
                        }
                    }
                }
                None => task,
            },
            Err(_) => task,
        };

        let embed_id = task.embed_id().to_string();
        let _ = self.results_tx.send(WorkerResult {
            id,
            embed_id,
            output: execute(task),
        });
        id
    }

    /// Number of tasks submitted so far. Each one posts exactly one result
    /// unless the pool is shut down while it runs.
    pub fn submitted(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    /// Hand the result channel to a consumer. Returns `None` once taken.
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<WorkerResult>> {
        self.results_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Take every result posted so far. Empty once the channel was taken.
    pub fn drain(&self) -> Vec<WorkerResult> {
        let Ok(mut guard) = self.results_rx.lock() else {
            return Vec::new();
        };
        let Some(rx) = guard.as_mut() else {
            return Vec::new();
        };
        let mut results = Vec::new();
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }
        results
    }

    /// Wait until no submitted task is still running.
    pub async fn settle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop the workers; later tasks run inline.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.take();
        }
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        self.in_flight.store(0, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn run_worker(
    queue: Arc<tokio::sync::Mutex<TaskQueue>>,
    results: mpsc::UnboundedSender<WorkerResult>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some((id, task)) = next else {
            break;
        };
        let embed_id = task.embed_id().to_string();
        let output = execute(task);
        let _ = results.send(WorkerResult {
            id,
            embed_id,
            output,
        });
        in_flight.fetch_sub(1, Ordering::SeqCst);
        idle.notify_waiters();
    }
}
