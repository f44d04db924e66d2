//! Namespaced background-daemon scheduler.
//!
//! Autoscalers and the rack monitor are periodic tasks whose definition is
//! derived from the governing cluster spec. The scheduler here remembers,
//! per namespace, the projection of the spec it last reacted to; callers may
//! invoke `on_spec_change` on every reconciliation pass and tasks are only
//! ever restarted when the projection actually changed.
//!
//! Cancellation is a two-step rendezvous: a stop signal interrupts the task
//! (dropping any in-flight cycle), then the caller joins the task handle
//! before starting the replacement generation. No two generations of the
//! same periodic task ever run concurrently; the cost is that a spec change
//! may block for up to one in-flight cycle.
//!
//! Task cycles themselves are serialized through a scheduler-wide execution
//! gate: cycles of different tasks interleave but never overlap.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// A periodic background task run by the scheduler.
#[async_trait]
pub trait DaemonTask: Send + 'static {
    /// The task's name, used in logs.
    fn name(&self) -> &str;

    /// Run one cycle.
    ///
    /// Implementations handle their own errors; a failed cycle is logged and
    /// retried on the next period, it never aborts the task loop.
    async fn execute(&mut self);
}

/// A daemon task together with its fixed-delay period.
pub struct Periodic {
    pub period: Duration,
    pub task: Box<dyn DaemonTask>,
}

struct TaskHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Scheduler-owned state for one namespace.
struct NamespaceContext<T> {
    /// The projection of the governing spec last reacted to.
    spec: Option<T>,
    /// The live scheduled tasks for this namespace.
    tasks: Vec<TaskHandle>,
}

/// Periodic task scheduler keyed by namespace.
///
/// The single-threaded reconciliation dispatch is the only caller of
/// `on_spec_change`; the scheduled tasks themselves run concurrently with it
/// on the runtime.
pub struct DaemonScheduler<T> {
    contexts: HashMap<String, NamespaceContext<T>>,
    /// Execution gate shared by every scheduled task. Cycles of different
    /// tasks interleave but never overlap, so a bookie decommission in one
    /// set can not run under another set's cluster-wide replication audit.
    gate: Arc<Mutex<()>>,
}

impl<T: PartialEq> DaemonScheduler<T> {
    /// Create a new instance.
    pub fn new() -> Self {
        Self { contexts: HashMap::new(), gate: Arc::new(Mutex::new(())) }
    }

    /// React to the (possibly unchanged) governing spec of a namespace.
    ///
    /// When the projection is value-equal to the remembered one this is a
    /// no-op. Otherwise all scheduled tasks for the namespace are cancelled
    /// and joined, and `build` derives the new task set, which may be empty
    /// when the corresponding feature is disabled. The new projection is
    /// remembered either way.
    pub async fn on_spec_change<F>(&mut self, namespace: &str, projection: T, build: F)
    where
        F: FnOnce(&T) -> Vec<Periodic>,
    {
        let ctx = self
            .contexts
            .entry(namespace.to_string())
            .or_insert_with(|| NamespaceContext { spec: None, tasks: Vec::new() });
        if ctx.spec.as_ref() == Some(&projection) {
            return;
        }

        tracing::info!(%namespace, "daemon spec changed, rescheduling background tasks");
        cancel_tasks(&mut ctx.tasks).await;
        for periodic in build(&projection) {
            ctx.tasks.push(spawn_task(namespace, periodic, self.gate.clone()));
        }
        ctx.spec = Some(projection);
    }

    /// Cancel and forget all tasks for one namespace.
    pub async fn forget(&mut self, namespace: &str) {
        if let Some(mut ctx) = self.contexts.remove(namespace) {
            tracing::debug!(%namespace, "cancelling daemon tasks for namespace");
            cancel_tasks(&mut ctx.tasks).await;
        }
    }

    /// Cancel every scheduled task and forget all namespace state.
    pub async fn shutdown(&mut self) {
        for (namespace, mut ctx) in self.contexts.drain() {
            tracing::debug!(%namespace, "cancelling daemon tasks for namespace");
            cancel_tasks(&mut ctx.tasks).await;
        }
    }
}

/// Cancel the given tasks, joining each before returning.
async fn cancel_tasks(tasks: &mut Vec<TaskHandle>) {
    for task in tasks.drain(..) {
        let _ = task.stop_tx.send(true);
        if let Err(err) = task.handle.await {
            // Swallowed: the task is gone either way.
            tracing::debug!(error = ?err, task = %task.name, "error joining cancelled daemon task");
        }
    }
}

fn spawn_task(namespace: &str, periodic: Periodic, gate: Arc<Mutex<()>>) -> TaskHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut task = periodic.task;
    let period = periodic.period;
    let name = task.name().to_string();
    let task_name = name.clone();
    let namespace = namespace.to_string();
    tracing::debug!(%namespace, task = %task_name, period = ?period, "scheduling daemon task");
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = run_cycle(task.as_mut(), &gate) => (),
                _ = stop_rx.changed() => break,
            }
            // Fixed-delay scheduling: the next cycle begins one full period
            // after the previous one finished.
            tokio::select! {
                _ = tokio::time::sleep(period) => (),
                _ = stop_rx.changed() => break,
            }
        }
        tracing::debug!(%namespace, task = %task_name, "daemon task stopped");
    });
    TaskHandle { name, stop_tx, handle }
}

/// Run one task cycle under the scheduler's shared execution gate.
async fn run_cycle(task: &mut dyn DaemonTask, gate: &Mutex<()>) {
    let _serial = gate.lock().await;
    task.execute().await;
}
