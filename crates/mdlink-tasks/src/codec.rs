//! The task codec: everything a task may do with the connection.
//!
//! A [`TaskCodec`] exists once per connection. The connection side drives it
//! through a [`TaskController`]; tasks see it through an
//! [`ActiveTaskCodecHandle`] or the more restricted
//! [`PassiveTaskCodecHandle`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::try_join;
use mdlink_crypto::{NonceGuard, NonceScope};
use mdlink_proto::{d2d, d2m};
use mdlink_protocol::{
    InboundMessage, Layer, OutboundMessage, Reflect, SequenceNumberU32, SequenceNumberU53, U53,
};
use prost::Message;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::demux::{Demux, DemuxError, Labelled, MessageFilterInstruction};
use crate::error::{Result, TaskError};
use crate::services::TaskServices;
use crate::task::ActiveTask;

pub use d2d::transaction_scope::Scope as TransactionScope;

/// Largest random padding added to a reflected envelope.
const MAX_PADDING: usize = 15;

impl Labelled for InboundMessage {
    fn label(&self) -> &'static str {
        InboundMessage::label(self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkState {
    csp: bool,
    d2m: bool,
    closed: bool,
}

impl LinkState {
    fn authenticated(&self, layer: Layer) -> bool {
        match layer {
            Layer::Csp => self.csp,
            Layer::D2m => self.d2m,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenTransaction {
    id: U53,
    scope: TransactionScope,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TaskCodec {
    demux: Demux<InboundMessage>,
    outbound: mpsc::Sender<OutboundMessage>,
    link: watch::Receiver<LinkState>,
    reflect_ids: Mutex<SequenceNumberU32>,
    transaction_ids: Mutex<SequenceNumberU53>,
    transaction: Mutex<Option<OpenTransaction>>,
    services: Arc<TaskServices>,
}

impl TaskCodec {
    pub fn services(&self) -> &Arc<TaskServices> {
        &self.services
    }

    pub fn is_closed(&self) -> bool {
        self.demux.is_closed()
    }

    pub fn backlog_len(&self) -> usize {
        self.demux.backlog_len()
    }

    /// Remove the oldest backlogged message matching `predicate`.
    pub(crate) fn take_backlogged(
        &self,
        predicate: impl FnMut(&InboundMessage) -> bool,
    ) -> Option<InboundMessage> {
        self.demux.take_first(predicate)
    }

    /// Resolves once a message was backlogged or the connection closed.
    pub(crate) async fn changed(&self) {
        self.demux.changed().await
    }

    async fn write(&self, message: OutboundMessage) -> Result<()> {
        let layer = message.layer();
        let mut link = self.link.clone();
        let closed = link
            .wait_for(|state| state.closed || state.authenticated(layer))
            .await
            .map_err(|_| TaskError::ConnectionClosed)?
            .closed;
        if closed || self.demux.is_closed() {
            return Err(TaskError::ConnectionClosed);
        }
        tracing::trace!(message = message.label(), "write");
        self.outbound
            .send(message)
            .await
            .map_err(|_| TaskError::ConnectionClosed)
    }

    async fn read<R, F>(&self, filter: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnMut(&InboundMessage) -> MessageFilterInstruction<R> + Send + 'static,
    {
        self.demux.read(filter).await.map_err(|err| match err {
            DemuxError::Closed => TaskError::ConnectionClosed,
            DemuxError::Rejected(label) => TaskError::protocol(format!("unexpected {label}")),
        })
    }

    async fn step<R, F, Fut>(&self, executor: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.demux.is_closed() {
            return Err(TaskError::ConnectionClosed);
        }
        executor().await
    }

    pub(crate) fn check_transaction(
        &self,
        task: &'static str,
        required: Option<TransactionScope>,
    ) -> Result<()> {
        let Some(required) = required else {
            return Ok(());
        };
        match *lock(&self.transaction) {
            Some(open) if open.scope == required => Ok(()),
            Some(open) => Err(TaskError::protocol(format!(
                "{task} requires a {required:?} transaction but {:?} is open",
                open.scope
            ))),
            None => Err(TaskError::protocol(format!(
                "{task} requires a {required:?} transaction"
            ))),
        }
    }
}

/// Connection side of a [`TaskCodec`].
///
/// Dropping the controller closes the codec.
pub struct TaskController {
    codec: Arc<TaskCodec>,
    link: watch::Sender<LinkState>,
}

impl TaskController {
    /// Create the codec of a new connection. Messages written by tasks are
    /// delivered to the returned receiver in order.
    pub fn new(
        services: Arc<TaskServices>,
        outbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        let (link, link_rx) = watch::channel(LinkState::default());
        let codec = Arc::new(TaskCodec {
            demux: Demux::new(),
            outbound,
            link: link_rx,
            reflect_ids: Mutex::new(SequenceNumberU32::new(0)),
            transaction_ids: Mutex::new(SequenceNumberU53::new(U53::ZERO)),
            transaction: Mutex::new(None),
            services,
        });
        (Self { codec, link }, outbound_rx)
    }

    pub fn codec(&self) -> Arc<TaskCodec> {
        Arc::clone(&self.codec)
    }

    /// Hand an inbound message to the readers, or backlog it.
    pub fn push(&self, message: InboundMessage) {
        tracing::trace!(message = message.label(), "read");
        self.codec.demux.push(message);
    }

    /// Allow writes towards `layer`.
    pub fn authenticated(&self, layer: Layer) {
        tracing::debug!(?layer, "layer authenticated");
        self.link.send_modify(|state| match layer {
            Layer::Csp => state.csp = true,
            Layer::D2m => state.d2m = true,
        });
    }

    /// Fail all pending and future reads and writes.
    pub fn close(&self) {
        self.link.send_modify(|state| state.closed = true);
        self.codec.demux.close();
    }
}

impl Drop for TaskController {
    fn drop(&mut self) {
        self.close();
    }
}

/// Proof that a transaction is running.
#[derive(Debug)]
pub struct TransactionRunning {
    id: U53,
    scope: TransactionScope,
}

/// Proof that a transaction was committed.
#[derive(Debug)]
pub struct TransactionComplete {
    id: U53,
    scope: TransactionScope,
}

/// Proof that a transaction ended without running its executor because the
/// precondition no longer held.
#[derive(Debug)]
pub struct TransactionAborted {
    id: U53,
    scope: TransactionScope,
}

macro_rules! transaction_token {
    ($($name:ident),*) => {
        $(
            impl $name {
                pub fn id(&self) -> U53 {
                    self.id
                }

                pub fn scope(&self) -> TransactionScope {
                    self.scope
                }
            }
        )*
    };
}

transaction_token!(TransactionRunning, TransactionComplete, TransactionAborted);

#[derive(Debug)]
pub enum TransactionResult<R> {
    Complete(TransactionComplete, R),
    Aborted(TransactionAborted),
}

/// Handle given to active tasks.
#[derive(Clone)]
pub struct ActiveTaskCodecHandle {
    codec: Arc<TaskCodec>,
}

impl ActiveTaskCodecHandle {
    pub fn new(codec: Arc<TaskCodec>) -> Self {
        Self { codec }
    }

    pub fn services(&self) -> &Arc<TaskServices> {
        &self.codec.services
    }

    /// Send a message once the layer it belongs to is authenticated.
    pub async fn write(&self, message: OutboundMessage) -> Result<()> {
        self.codec.write(message).await
    }

    /// Wait for the first message `filter` accepts.
    pub async fn read<R, F>(&self, filter: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnMut(&InboundMessage) -> MessageFilterInstruction<R> + Send + 'static,
    {
        self.codec.read(filter).await
    }

    pub async fn step<R, F, Fut>(&self, executor: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.codec.step(executor).await
    }

    /// Run `task` as part of the calling task.
    pub async fn run<T: ActiveTask>(&self, task: &T) -> Result<T::Output> {
        self.codec.check_transaction(task.name(), task.transaction())?;
        task.run(self).await
    }

    /// Encrypt and reflect `envelopes` to the other devices of the group.
    ///
    /// Returns the mediator timestamps of the reflections, in order.
    pub async fn reflect(&self, envelopes: Vec<d2d::Envelope>) -> Result<Vec<u64>> {
        let services = &self.codec.services;
        let reflect_box = services.keys.reflect_box()?;

        let mut pending: Vec<(u32, Vec<u8>, NonceGuard)> = Vec::with_capacity(envelopes.len());
        for mut envelope in envelopes {
            envelope.padding = random_padding();
            envelope.device_id = services.device_id.0;
            let reflect_id = lock(&self.codec.reflect_ids).next()?;
            let guard = services.nonces.random_nonce(NonceScope::D2d)?;
            match reflect_box.encrypt_nonce_ahead(&guard, &envelope.encode_to_vec()) {
                Ok(encrypted) => pending.push((reflect_id, encrypted, guard)),
                Err(err) => {
                    guard.discard();
                    for (_, _, guard) in pending {
                        guard.discard();
                    }
                    return Err(err.into());
                }
            }
        }
        let reflect_ids: Vec<u32> = pending.iter().map(|(id, _, _)| *id).collect();

        let write_all = async {
            let mut pending = pending.into_iter();
            while let Some((reflect_id, envelope, guard)) = pending.next() {
                let written = self
                    .write(OutboundMessage::Reflect(Reflect {
                        flags: 0,
                        reflect_id,
                        envelope,
                    }))
                    .await;
                if let Err(err) = written {
                    guard.discard();
                    pending.for_each(|(_, _, guard)| guard.discard());
                    return Err(err);
                }
                guard.commit()?;
            }
            Ok::<_, TaskError>(())
        };
        let read_all = async {
            let mut timestamps = Vec::with_capacity(reflect_ids.len());
            for (index, expected) in reflect_ids.iter().copied().enumerate() {
                let timestamp = self
                    .read(move |message| match message {
                        InboundMessage::ReflectAck(ack) if ack.reflect_id == expected => {
                            MessageFilterInstruction::Accept(ack.timestamp)
                        }
                        // A late ack of an earlier reflection may precede ours.
                        InboundMessage::ReflectAck(_) if index == 0 => {
                            MessageFilterInstruction::BypassOrBacklog
                        }
                        InboundMessage::ReflectAck(_) => MessageFilterInstruction::Reject,
                        _ => MessageFilterInstruction::BypassOrBacklog,
                    })
                    .await?;
                timestamps.push(timestamp);
            }
            Ok::<_, TaskError>(timestamps)
        };
        let ((), timestamps) = try_join(write_all, read_all).await?;
        tracing::debug!(count = timestamps.len(), "reflected");
        Ok(timestamps)
    }

    /// Run `executor` inside a device group transaction of `scope`.
    ///
    /// While another device holds a transaction, waits for it to end and
    /// retries. The executor is skipped once `precondition` no longer holds.
    pub async fn transaction<R, P, E, Fut>(
        &self,
        scope: TransactionScope,
        mut precondition: P,
        executor: E,
    ) -> Result<TransactionResult<R>>
    where
        P: FnMut() -> bool,
        E: FnOnce(TransactionRunning) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let id = lock(&self.codec.transaction_ids).next()?;
        if !precondition() {
            return Ok(TransactionResult::Aborted(TransactionAborted { id, scope }));
        }
        let encrypted_scope = self
            .codec
            .services
            .keys
            .transaction_scope_box()?
            .encrypt_random_nonce_ahead(
                &d2d::TransactionScope {
                    scope: scope as i32,
                }
                .encode_to_vec(),
            )?;

        loop {
            self.write(OutboundMessage::BeginTransaction(d2m::BeginTransaction {
                encrypted_scope: encrypted_scope.clone(),
                ttl: 0,
            }))
            .await?;
            let begun = self
                .read(|message| match message {
                    InboundMessage::BeginTransactionAck => MessageFilterInstruction::Accept(true),
                    InboundMessage::TransactionRejected(_) => {
                        MessageFilterInstruction::Accept(false)
                    }
                    _ => MessageFilterInstruction::BypassOrBacklog,
                })
                .await?;
            if begun {
                break;
            }

            tracing::debug!(%id, ?scope, "transaction rejected, waiting for it to end");
            self.read(|message| match message {
                InboundMessage::TransactionEnded(_) => MessageFilterInstruction::Accept(()),
                InboundMessage::TransactionRejected(_) => MessageFilterInstruction::Reject,
                _ => MessageFilterInstruction::BypassOrBacklog,
            })
            .await?;
            if !precondition() {
                return Ok(TransactionResult::Aborted(TransactionAborted { id, scope }));
            }
        }

        *lock(&self.codec.transaction) = Some(OpenTransaction { id, scope });
        tracing::debug!(%id, ?scope, "transaction begun");

        let outcome = if precondition() {
            Some(executor(TransactionRunning { id, scope }).await)
        } else {
            None
        };
        let outcome = match outcome {
            Some(Err(err)) if err.is_connection_fatal() => {
                *lock(&self.codec.transaction) = None;
                return Err(err);
            }
            other => other,
        };

        let committed = self.commit_transaction().await;
        *lock(&self.codec.transaction) = None;
        committed?;
        tracing::debug!(%id, ?scope, "transaction committed");

        match outcome {
            Some(value) => Ok(TransactionResult::Complete(
                TransactionComplete { id, scope },
                value?,
            )),
            None => Ok(TransactionResult::Aborted(TransactionAborted { id, scope })),
        }
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.write(OutboundMessage::CommitTransaction).await?;
        self.read(|message| match message {
            InboundMessage::CommitTransactionAck => MessageFilterInstruction::Accept(()),
            _ => MessageFilterInstruction::BypassOrBacklog,
        })
        .await
    }

    /// Scope of the transaction currently open on this connection.
    pub fn current_transaction(&self) -> Option<(U53, TransactionScope)> {
        lock(&self.codec.transaction).map(|open| (open.id, open.scope))
    }
}

/// Handle given to passive tasks: acknowledgements and steps only.
pub struct PassiveTaskCodecHandle {
    codec: Arc<TaskCodec>,
}

impl PassiveTaskCodecHandle {
    pub fn new(codec: Arc<TaskCodec>) -> Self {
        Self { codec }
    }

    pub fn services(&self) -> &Arc<TaskServices> {
        &self.codec.services
    }

    pub async fn write(&self, message: OutboundMessage) -> Result<()> {
        self.codec.write(message).await
    }

    pub async fn step<R, F, Fut>(&self, executor: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.codec.step(executor).await
    }
}

fn random_padding() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut padding = vec![0u8; rng.gen_range(0..=MAX_PADDING)];
    rng.fill(padding.as_mut_slice());
    padding
}
