//! Ordered queue with replay.
//!
//! Every inbound item is offered to the pending readers in the order they
//! started reading. The first reader whose filter accepts the item consumes
//! it. Items nobody accepts are appended to the backlog, which each new read
//! scans from the oldest entry before waiting. Items are never discarded
//! while the demultiplexer is open.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Notify, oneshot};

/// Decision of a read filter about one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilterInstruction<R> {
    /// Consume the item, handing `R` to the reader.
    Accept(R),
    /// Leave the item for other readers or the backlog.
    BypassOrBacklog,
    /// The item must not arrive at this point. Fails the read.
    Reject,
}

/// Items that can name themselves in error messages.
pub trait Labelled {
    fn label(&self) -> &'static str;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    #[error("demultiplexer closed")]
    Closed,

    #[error("unexpected {0}")]
    Rejected(&'static str),
}

enum Offer {
    Claimed,
    Passed,
    Rejected,
}

trait Waiter<T>: Send {
    fn offer(&mut self, item: &T) -> Offer;
    fn is_gone(&self) -> bool;
    fn close(self: Box<Self>);
}

struct FilteredRead<F, R> {
    filter: F,
    tx: Option<oneshot::Sender<Result<R, DemuxError>>>,
}

impl<T, F, R> Waiter<T> for FilteredRead<F, R>
where
    T: Labelled,
    F: FnMut(&T) -> MessageFilterInstruction<R> + Send,
    R: Send,
{
    fn offer(&mut self, item: &T) -> Offer {
        let Some(tx) = self.tx.take() else {
            return Offer::Passed;
        };
        match (self.filter)(item) {
            MessageFilterInstruction::Accept(value) => match tx.send(Ok(value)) {
                Ok(()) => Offer::Claimed,
                // The reader went away in the meantime. The item stays.
                Err(_) => Offer::Passed,
            },
            MessageFilterInstruction::BypassOrBacklog => {
                self.tx = Some(tx);
                Offer::Passed
            }
            MessageFilterInstruction::Reject => {
                let _ = tx.send(Err(DemuxError::Rejected(item.label())));
                Offer::Rejected
            }
        }
    }

    fn is_gone(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    fn close(self: Box<Self>) {
        if let Some(tx) = self.tx {
            let _ = tx.send(Err(DemuxError::Closed));
        }
    }
}

struct Inner<T> {
    backlog: VecDeque<T>,
    pending: VecDeque<Box<dyn Waiter<T>>>,
    closed: bool,
}

pub struct Demux<T> {
    inner: Mutex<Inner<T>>,
    changed: Notify,
}

impl<T> Default for Demux<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                backlog: VecDeque::new(),
                pending: VecDeque::new(),
                closed: false,
            }),
            changed: Notify::new(),
        }
    }
}

impl<T: Labelled + Send + 'static> Demux<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a new item to the pending readers, backlogging it if none accepts.
    pub fn push(&self, item: T) {
        {
            let mut inner = self.lock();
            if inner.closed {
                tracing::debug!(item = item.label(), "dropping item after close");
                return;
            }
            inner.pending.retain(|waiter| !waiter.is_gone());

            let mut index = 0;
            while index < inner.pending.len() {
                match inner.pending[index].offer(&item) {
                    Offer::Claimed => {
                        inner.pending.remove(index);
                        return;
                    }
                    Offer::Rejected => {
                        inner.pending.remove(index);
                        break;
                    }
                    Offer::Passed => index += 1,
                }
            }
            inner.backlog.push_back(item);
        }
        self.changed.notify_one();
    }

    /// Wait for the first item, backlogged or new, that `filter` accepts.
    pub async fn read<R, F>(&self, mut filter: F) -> Result<R, DemuxError>
    where
        R: Send + 'static,
        F: FnMut(&T) -> MessageFilterInstruction<R> + Send + 'static,
    {
        let rx = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(DemuxError::Closed);
            }

            let mut claimed = None;
            for (index, item) in inner.backlog.iter().enumerate() {
                match filter(item) {
                    MessageFilterInstruction::Accept(value) => {
                        claimed = Some((index, value));
                        break;
                    }
                    MessageFilterInstruction::BypassOrBacklog => {}
                    MessageFilterInstruction::Reject => {
                        return Err(DemuxError::Rejected(item.label()));
                    }
                }
            }
            if let Some((index, value)) = claimed {
                inner.backlog.remove(index);
                return Ok(value);
            }

            let (tx, rx) = oneshot::channel();
            inner.pending.push_back(Box::new(FilteredRead {
                filter,
                tx: Some(tx),
            }));
            rx
        };
        rx.await.unwrap_or(Err(DemuxError::Closed))
    }

    /// Remove and return the oldest backlogged item matching `predicate`.
    pub fn take_first(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let mut inner = self.lock();
        let index = inner.backlog.iter().position(|item| predicate(item))?;
        inner.backlog.remove(index)
    }

    /// Resolves after an item was backlogged or the demultiplexer closed.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Fail all pending and future reads.
    pub fn close(&self) {
        let pending = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.pending)
        };
        for waiter in pending {
            waiter.close();
        }
        self.changed.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }
}
