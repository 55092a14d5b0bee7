use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

/// Per-scope sink for fire-and-forget work.
///
/// Queued tasks run on the server's event loop after the current handler
/// returns; their failures are logged and never affect the already-sent
/// response. Ordering across independent `add` calls is not guaranteed.
#[derive(Clone)]
pub struct Tasks {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl Tasks {
    /// A connected sink plus the queue the server drains.
    pub fn channel() -> (Tasks, TaskQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Tasks { tx }, TaskQueue { rx })
    }

    /// A sink with no consumer; queued tasks are dropped. Used for scopes
    /// that cannot run background work (lifespan) and in tests.
    pub fn disconnected() -> Tasks {
        let (tx, _rx) = mpsc::unbounded_channel();
        Tasks { tx }
    }

    /// Schedule a task to run after the handler returns.
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // An error here means the scope already finished and its queue was
        // dropped; late adds are discarded, matching fire-and-forget.
        let _ = self.tx.send(task.boxed());
    }

    /// Schedule a fallible task; a failure is logged and swallowed.
    pub fn add_fallible<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(async move {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "background task failed");
            }
        });
    }
}

impl std::fmt::Debug for Tasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasks").finish_non_exhaustive()
    }
}

/// The server-owned side of a [`Tasks`] sink.
pub struct TaskQueue {
    rx: mpsc::UnboundedReceiver<BoxFuture<'static, ()>>,
}

impl TaskQueue {
    /// Take every task queued so far. Called once the handler has returned,
    /// so nothing further can be added concurrently with the drain.
    pub fn drain(&mut self) -> Vec<BoxFuture<'static, ()>> {
        let mut tasks = Vec::new();
        while let Ok(task) = self.rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn queued_tasks_run_when_drained() {
        let (tasks, mut queue) = Tasks::channel();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            tasks.add(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        for task in drained {
            task.await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fallible_task_failure_is_contained() {
        let (tasks, mut queue) = Tasks::channel();
        tasks.add_fallible(async { anyhow::bail!("boom") });
        for task in queue.drain() {
            task.await; // must not panic
        }
    }

    #[test]
    fn disconnected_sink_accepts_and_discards() {
        let tasks = Tasks::disconnected();
        tasks.add(async {});
    }
}
