//! Task traits and scheduling.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use mdlink_protocol::MessageId;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{ActiveTaskCodecHandle, PassiveTaskCodecHandle, TaskCodec, TransactionScope};
use crate::error::{Result, TaskError};

pub type TaskFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Whether a task survives a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Rescheduled on the next connection until it completes.
    Persistent,
    /// Aborted when the connection is lost.
    Volatile,
}

/// A task that may read, write, reflect and run transactions.
///
/// `run` takes `&self` so that a persistent task can be restarted from the
/// beginning after a reconnect.
pub trait ActiveTask: Send + Sync + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn persistence(&self) -> Persistence;

    /// Transaction that must be open while the task runs.
    fn transaction(&self) -> Option<TransactionScope> {
        None
    }

    fn message_id(&self) -> Option<MessageId> {
        None
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, Self::Output>;
}

/// A task that reacts to an inbound message and may only acknowledge it.
pub trait PassiveTask: Send + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn message_id(&self) -> Option<MessageId> {
        None
    }

    fn run<'a>(&'a mut self, handle: &'a PassiveTaskCodecHandle) -> TaskFuture<'a, Self::Output>;
}

/// A step run inside another task, sharing the parent's handle.
pub trait ComposableTask<H>: Send {
    type Output: Send;

    fn run<'a>(&'a mut self, handle: &'a H) -> TaskFuture<'a, Self::Output>;
}

pub(crate) trait ErasedActiveTask: Send + Sync {
    fn name(&self) -> &'static str;
    fn persistence(&self) -> Persistence;
    fn transaction(&self) -> Option<TransactionScope>;
    fn message_id(&self) -> Option<MessageId>;
    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> BoxFuture<'a, Result<()>>;
    /// Resolve the scheduler's result with `error`.
    fn fail(&self, error: TaskError);
}

pub(crate) trait ErasedPassiveTask: Send {
    fn name(&self) -> &'static str;
    fn message_id(&self) -> Option<MessageId>;
    fn run<'a>(&'a mut self, handle: &'a PassiveTaskCodecHandle) -> BoxFuture<'a, Result<()>>;
}

type ResultSender<T> = Mutex<Option<oneshot::Sender<Result<T>>>>;

/// An active task together with the channel its result goes to.
struct Scheduled<T: ActiveTask> {
    task: T,
    result: ResultSender<T::Output>,
}

impl<T: ActiveTask> Scheduled<T> {
    fn resolve(&self, result: Result<T::Output>) {
        let sender = self
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The scheduler may have stopped waiting.
            let _ = sender.send(result);
        }
    }
}

impl<T: ActiveTask> ErasedActiveTask for Scheduled<T> {
    fn name(&self) -> &'static str {
        self.task.name()
    }

    fn persistence(&self) -> Persistence {
        self.task.persistence()
    }

    fn transaction(&self) -> Option<TransactionScope> {
        self.task.transaction()
    }

    fn message_id(&self) -> Option<MessageId> {
        self.task.message_id()
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> BoxFuture<'a, Result<()>> {
        async move {
            let output = self.task.run(handle).await?;
            self.resolve(Ok(output));
            Ok(())
        }
        .boxed()
    }

    fn fail(&self, error: TaskError) {
        self.resolve(Err(error));
    }
}

impl<T: PassiveTask> ErasedPassiveTask for T {
    fn name(&self) -> &'static str {
        PassiveTask::name(self)
    }

    fn message_id(&self) -> Option<MessageId> {
        PassiveTask::message_id(self)
    }

    fn run<'a>(&'a mut self, handle: &'a PassiveTaskCodecHandle) -> BoxFuture<'a, Result<()>> {
        PassiveTask::run(self, handle).map(|r| r.map(drop)).boxed()
    }
}

/// Anything the task manager executes.
pub(crate) enum RunnableTask {
    Active(Box<dyn ErasedActiveTask>),
    Passive(Box<dyn ErasedPassiveTask>),
}

impl RunnableTask {
    /// An active task nobody waits for, e.g. one created from an inbound
    /// message.
    pub(crate) fn active<T: ActiveTask>(task: T) -> Self {
        RunnableTask::Active(Box::new(Scheduled {
            task,
            result: Mutex::new(None),
        }))
    }

    pub(crate) fn passive<T: PassiveTask>(task: T) -> Self {
        RunnableTask::Passive(Box::new(task))
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            RunnableTask::Active(task) => task.name(),
            RunnableTask::Passive(task) => task.name(),
        }
    }

    pub(crate) fn message_id(&self) -> Option<MessageId> {
        match self {
            RunnableTask::Active(task) => task.message_id(),
            RunnableTask::Passive(task) => task.message_id(),
        }
    }

    pub(crate) fn persistence(&self) -> Persistence {
        match self {
            RunnableTask::Active(task) => task.persistence(),
            RunnableTask::Passive(_) => Persistence::Volatile,
        }
    }

    pub(crate) async fn run(&mut self, codec: &Arc<TaskCodec>) -> Result<()> {
        match self {
            RunnableTask::Active(task) => {
                codec.check_transaction(task.name(), task.transaction())?;
                let handle = ActiveTaskCodecHandle::new(Arc::clone(codec));
                task.run(&handle).await
            }
            RunnableTask::Passive(task) => {
                let handle = PassiveTaskCodecHandle::new(Arc::clone(codec));
                task.run(&handle).await
            }
        }
    }

    /// Resolve a waiting scheduler with `error`.
    pub(crate) fn fail(&self, error: TaskError) {
        match self {
            RunnableTask::Active(task) => task.fail(error),
            RunnableTask::Passive(_) => {}
        }
    }
}

/// Result of a scheduled task. Resolves to [`TaskError::Aborted`] if the
/// task was dropped without running to completion.
pub struct TaskResult<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskResult<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TaskError::Aborted)))
    }
}

/// Queue of tasks handed to the [`TaskManager`](crate::manager::TaskManager).
pub struct TaskQueue {
    pub(crate) rx: mpsc::UnboundedReceiver<RunnableTask>,
}

#[derive(Clone)]
pub struct TaskScheduler {
    tx: mpsc::UnboundedSender<RunnableTask>,
}

impl TaskScheduler {
    pub fn channel() -> (TaskScheduler, TaskQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TaskScheduler { tx }, TaskQueue { rx })
    }

    pub fn schedule<T: ActiveTask>(&self, task: T) -> TaskResult<T::Output> {
        let (result_tx, rx) = oneshot::channel();
        let name = task.name();
        let scheduled = RunnableTask::Active(Box::new(Scheduled {
            task,
            result: Mutex::new(Some(result_tx)),
        }));
        if self.tx.send(scheduled).is_err() {
            tracing::warn!(task = name, "task manager gone, task dropped");
        }
        TaskResult { rx }
    }
}
