//! Bounded concurrent dispatcher for bulk writes.
//!
//! Every worker owns one client for its whole life. Clients are built by
//! the dispatcher before any worker starts, so a login failure is reported
//! once instead of per task. Workers only return results; callers apply
//! them (for example to an identity map) on the dispatching task.

use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Builds the per-worker client.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    type Client: Send + Sync + 'static;

    async fn create(&self, worker_id: usize) -> Result<Self::Client>;
}

/// A task paired with its result. `task_id` is the task's input position.
#[derive(Debug)]
pub struct TaskOutcome<T, R> {
    pub task_id: usize,
    pub task: T,
    pub result: Result<R>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` for every task and return one outcome per task.
    ///
    /// Completion order is unspecified when more than one worker runs. A
    /// failing or panicking task only fails its own outcome.
    pub async fn run_all<T, R, CF, F, Fut>(
        &self,
        tasks: Vec<T>,
        factory: &CF,
        job: F,
    ) -> Result<Vec<TaskOutcome<T, R>>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        CF: ClientFactory + ?Sized,
        F: Fn(Arc<CF::Client>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let mut outcomes = Vec::with_capacity(tasks.len());
        self.run_batched(tasks, usize::MAX, factory, job, |batch| {
            outcomes.extend(batch);
            Ok(())
        })
        .await?;
        Ok(outcomes)
    }

    /// Like [`run_all`](Self::run_all), but hands the outcomes of every
    /// `batch_size` tasks to `apply` before the next batch is dispatched.
    ///
    /// Clients live across batches. An error from `apply` stops dispatching.
    pub async fn run_batched<T, R, CF, F, Fut, A>(
        &self,
        tasks: Vec<T>,
        batch_size: usize,
        factory: &CF,
        job: F,
        mut apply: A,
    ) -> Result<()>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        CF: ClientFactory + ?Sized,
        F: Fn(Arc<CF::Client>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        A: FnMut(Vec<TaskOutcome<T, R>>) -> Result<()>,
    {
        if tasks.is_empty() {
            return Ok(());
        }
        let total = tasks.len();
        let workers = self.workers.min(total);

        let mut clients = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            clients.push(Arc::new(factory.create(worker_id).await?));
        }
        if workers > 1 {
            info!("Dispatching {} tasks to {} workers", total, workers);
        }

        let job = Arc::new(job);
        let mut pending = tasks.into_iter().enumerate().peekable();
        while pending.peek().is_some() {
            let batch: Vec<(usize, T)> = pending.by_ref().take(batch_size.max(1)).collect();
            let outcomes = if workers == 1 {
                run_sequential(job.as_ref(), &clients[0], batch).await
            } else {
                dispatch(&clients, &job, batch).await?
            };
            apply(outcomes)?;
        }
        Ok(())
    }
}

async fn run_sequential<C, T, R, F, Fut>(
    job: &F,
    client: &Arc<C>,
    batch: Vec<(usize, T)>,
) -> Vec<TaskOutcome<T, R>>
where
    T: Clone,
    F: Fn(Arc<C>, T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut outcomes = Vec::with_capacity(batch.len());
    for (task_id, task) in batch {
        let result = run_guarded(job, client, 0, task_id, task.clone()).await;
        outcomes.push(TaskOutcome {
            task_id,
            task,
            result,
        });
    }
    outcomes
}

/// Run one batch on the worker tasks and wait for all of it.
async fn dispatch<C, T, R, F, Fut>(
    clients: &[Arc<C>],
    job: &Arc<F>,
    batch: Vec<(usize, T)>,
) -> Result<Vec<TaskOutcome<T, R>>>
where
    C: Send + Sync + 'static,
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(Arc<C>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let total = batch.len();
    let workers = clients.len().min(total);
    let (task_tx, task_rx) = async_channel::bounded::<(usize, T)>(workers * 2);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TaskOutcome<T, R>>();

    let mut handles = Vec::with_capacity(workers);
    for (worker_id, client) in clients.iter().take(workers).enumerate() {
        let client = Arc::clone(client);
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let job = Arc::clone(job);

        handles.push(tokio::spawn(async move {
            let mut done = 0usize;
            while let Ok((task_id, task)) = task_rx.recv().await {
                let result = run_guarded(job.as_ref(), &client, worker_id, task_id, task.clone()).await;
                done += 1;
                if result_tx
                    .send(TaskOutcome {
                        task_id,
                        task,
                        result,
                    })
                    .is_err()
                {
                    break;
                }
            }
            debug!("Worker {}: finished {} task(s)", worker_id, done);
        }));
    }

    // Only workers hold these now; both channels close when they finish.
    drop(task_rx);
    drop(result_tx);

    for task in batch {
        if task_tx.send(task).await.is_err() {
            break;
        }
    }
    drop(task_tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = result_rx.recv().await {
        outcomes.push(outcome);
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task failed: {}", e);
        }
    }

    if outcomes.len() != total {
        return Err(MigrateError::Invariant(format!(
            "worker pool returned {} outcomes for {} tasks",
            outcomes.len(),
            total
        )));
    }
    Ok(outcomes)
}

async fn run_guarded<C, T, R, F, Fut>(
    job: &F,
    client: &Arc<C>,
    worker_id: usize,
    task_id: usize,
    task: T,
) -> Result<R>
where
    F: Fn(Arc<C>, T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    match AssertUnwindSafe(job(Arc::clone(client), task))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(MigrateError::Invariant(format!(
            "worker {} panicked on task {}: {}",
            worker_id,
            task_id,
            panic_message(&panic)
        ))),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
