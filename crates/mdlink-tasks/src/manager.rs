//! Runs tasks one at a time against the current connection.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use mdlink_protocol::InboundMessage;

use crate::codec::TaskCodec;
use crate::error::{Result, TaskError};
use crate::task::{Persistence, RunnableTask, TaskQueue};
use crate::tasks::{DevicesInfoTask, IncomingMessageTask, ReflectedTask};

/// Messages that start a protocol flow on their own rather than answer a
/// task's request.
fn is_unsolicited(message: &InboundMessage) -> bool {
    matches!(
        message,
        InboundMessage::Reflected(_)
            | InboundMessage::IncomingMessage(_)
            | InboundMessage::DevicesInfo(_)
            | InboundMessage::ReflectionQueueDry
            | InboundMessage::RolePromotedToLeader
            | InboundMessage::QueueSendComplete
            | InboundMessage::TransactionEnded(_)
            | InboundMessage::Alert(_)
            | InboundMessage::CloseError(_)
    )
}

pub struct TaskManager {
    queue: TaskQueue,
    pending: VecDeque<RunnableTask>,
}

impl TaskManager {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            queue,
            pending: VecDeque::new(),
        }
    }

    /// Number of tasks waiting for a connection.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept tasks while there is no connection, until `until` resolves.
    ///
    /// Persistent tasks are kept for the next connection, volatile ones are
    /// aborted right away.
    pub async fn run_disconnected<F: Future<Output = ()>>(&mut self, until: F) {
        tokio::pin!(until);
        loop {
            tokio::select! {
                () = &mut until => return,
                task = self.queue.rx.recv() => match task {
                    Some(task) => self.accept_disconnected(task),
                    None => {
                        until.await;
                        return;
                    }
                },
            }
        }
    }

    fn accept_disconnected(&mut self, task: RunnableTask) {
        match task.persistence() {
            Persistence::Persistent => {
                tracing::debug!(task = task.name(), "queued until connected");
                self.pending.push_back(task);
            }
            Persistence::Volatile => {
                tracing::debug!(task = task.name(), "not connected, aborting");
                task.fail(TaskError::Aborted);
            }
        }
    }

    /// Run tasks against `codec` until the connection fails.
    ///
    /// Returns the error that tore the connection down. Afterwards the
    /// manager is disconnected again: persistent tasks, including the one
    /// that was running, stay queued, volatile ones are aborted.
    pub async fn run(&mut self, codec: Arc<TaskCodec>) -> TaskError {
        tracing::info!(pending = self.pending.len(), "task manager connected");
        let error = match self.run_connected(&codec).await {
            Ok(()) => TaskError::ConnectionClosed,
            Err(err) => err,
        };
        self.replace();
        tracing::info!(error = %error, pending = self.pending.len(), "task manager disconnected");
        error
    }

    /// Switch to the disconnected state.
    fn replace(&mut self) {
        while let Ok(task) = self.queue.rx.try_recv() {
            self.pending.push_back(task);
        }
        let pending = std::mem::take(&mut self.pending);
        for task in pending {
            self.accept_disconnected(task);
        }
    }

    async fn run_connected(&mut self, codec: &Arc<TaskCodec>) -> Result<()> {
        loop {
            while let Ok(task) = self.queue.rx.try_recv() {
                self.pending.push_back(task);
            }

            if let Some(task) = self.pending.front_mut() {
                match run_task(task, codec).await {
                    Ok(()) => {
                        self.pending.pop_front();
                    }
                    Err(err) if err.is_connection_fatal() => return Err(err),
                    Err(err) => {
                        if let Some(task) = self.pending.pop_front() {
                            task.fail(err);
                        }
                    }
                }
                continue;
            }

            if let Some(message) = codec.take_backlogged(is_unsolicited) {
                self.handle_unsolicited(message, codec).await?;
                continue;
            }

            if codec.is_closed() {
                return Err(TaskError::ConnectionClosed);
            }

            tokio::select! {
                task = self.queue.rx.recv() => match task {
                    Some(task) => self.pending.push_back(task),
                    None => return Ok(()),
                },
                () = codec.changed() => {}
            }
        }
    }

    async fn handle_unsolicited(
        &mut self,
        message: InboundMessage,
        codec: &Arc<TaskCodec>,
    ) -> Result<()> {
        let mut task = match message {
            InboundMessage::Reflected(reflected) => {
                RunnableTask::passive(ReflectedTask::new(reflected))
            }
            InboundMessage::IncomingMessage(message) => {
                RunnableTask::active(IncomingMessageTask::new(message))
            }
            InboundMessage::DevicesInfo(info) => RunnableTask::passive(DevicesInfoTask::new(info)),
            InboundMessage::ReflectionQueueDry => {
                tracing::info!("reflection queue dry");
                codec.services().mark_reflection_queue_dry();
                return Ok(());
            }
            InboundMessage::RolePromotedToLeader => {
                tracing::info!("promoted to leader");
                codec.services().mark_leader();
                return Ok(());
            }
            InboundMessage::QueueSendComplete => {
                tracing::info!("chat server queue drained");
                return Ok(());
            }
            InboundMessage::TransactionEnded(ended) => {
                tracing::debug!(device_id = ended.device_id, "transaction of another device ended");
                return Ok(());
            }
            InboundMessage::Alert(alert) => {
                tracing::warn!(message = %alert.message, "server alert");
                return Ok(());
            }
            InboundMessage::CloseError(close) => {
                return Err(TaskError::ServerClose {
                    message: close.message,
                    can_reconnect: close.can_reconnect,
                });
            }
            other => {
                tracing::debug!(message = other.label(), "ignoring message");
                return Ok(());
            }
        };

        match run_task(&mut task, codec).await {
            Err(err) if err.is_connection_fatal() => Err(err),
            _ => Ok(()),
        }
    }
}

async fn run_task(task: &mut RunnableTask, codec: &Arc<TaskCodec>) -> Result<()> {
    let name = task.name();
    tracing::debug!(task = name, "running task");
    let result = task.run(codec).await;
    if let Err(err) = &result {
        let message_id = task.message_id();
        if err.is_connection_fatal() {
            tracing::warn!(task = name, ?message_id, error = %err, "task interrupted");
        } else {
            tracing::error!(task = name, ?message_id, error = %err, "task failed");
        }
    }
    result
}
