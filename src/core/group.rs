// Structured concurrency scope for fan-out work

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Cancelled,
    Panicked(String),
}

#[derive(Debug)]
pub struct TaskReport<T> {
    pub label: String,
    pub outcome: TaskOutcome<T>,
}

impl<T> TaskReport<T> {
    pub fn into_value(self) -> Option<T> {
        match self.outcome {
            TaskOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }
}

/// A set of child tasks that share one cancellation scope.
///
/// The scope is a child of the token passed to [`TaskGroup::new`], so
/// cancelling the run cancels every group. Dropping the group cancels and
/// aborts whatever is still running.
pub struct TaskGroup<T> {
    tasks: JoinSet<Option<T>>,
    labels: HashMap<Id, String>,
    token: CancellationToken,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            labels: HashMap::new(),
            token: parent.child_token(),
        }
    }

    /// Token observed by every child of this group.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, label: impl Into<String>, fut: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                value = fut => Some(value),
            }
        });
        self.labels.insert(handle.id(), label.into());
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Await every child. Reports arrive in completion order.
    pub async fn join_all(&mut self) -> Vec<TaskReport<T>> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, Some(value))) => (id, TaskOutcome::Completed(value)),
                Ok((id, None)) => (id, TaskOutcome::Cancelled),
                Err(e) if e.is_panic() => {
                    let id = e.id();
                    (id, TaskOutcome::Panicked(panic_message(e.into_panic())))
                }
                Err(e) => (e.id(), TaskOutcome::Cancelled),
            };

            let label = self.labels.remove(&id).unwrap_or_default();
            match &outcome {
                TaskOutcome::Panicked(msg) => error!(task = %label, panic = %msg, "Task panicked"),
                TaskOutcome::Cancelled => debug!(task = %label, "Task cancelled"),
                TaskOutcome::Completed(_) => {}
            }
            reports.push(TaskReport { label, outcome });
        }
        reports
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
