//! Task engine of the multi-device protocol core.
//!
//! Protocol flows run as tasks on top of a [`TaskCodec`](codec::TaskCodec),
//! one at a time, scheduled by the [`TaskManager`](manager::TaskManager).
//! Models are changed through the `from_local`, `from_sync` and
//! `from_remote` entry points described in [`dispatch`].

pub mod call;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod demux;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod manager;
pub mod model;
pub mod nonce_store;
pub mod persistent_state;
pub mod services;
pub mod state_dir;
pub mod task;
pub mod tasks;

pub use codec::{
    ActiveTaskCodecHandle, PassiveTaskCodecHandle, TaskCodec, TaskController, TransactionResult,
    TransactionScope,
};
pub use demux::MessageFilterInstruction;
pub use dispatch::{DispatchError, DistributionEvent, DistributionLedger, Origin};
pub use error::{Result, TaskError};
pub use lock::AsyncLock;
pub use manager::TaskManager;
pub use services::TaskServices;
pub use task::{
    ActiveTask, ComposableTask, PassiveTask, Persistence, TaskFuture, TaskQueue, TaskResult,
    TaskScheduler,
};
