use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mdlink_crypto::device_group::DeviceGroupKeys;
use mdlink_crypto::{MemoryNonceStore, NonceService, NonceStore};
use mdlink_protocol::{DeviceId, IdentityString};

use crate::call::CallSlotController;
use crate::clock::{Clock, SystemClock};
use crate::dispatch::DistributionLedger;
use crate::model::Model;
use crate::persistent_state::PersistentProtocolState;
use crate::task::TaskScheduler;

/// Everything tasks and model controllers share, for the lifetime of the
/// process rather than of a connection.
pub struct TaskServices {
    pub identity: IdentityString,
    pub device_id: DeviceId,
    pub keys: DeviceGroupKeys,
    pub nonces: NonceService,
    pub model: Model,
    pub ledger: DistributionLedger,
    pub scheduler: TaskScheduler,
    pub state: PersistentProtocolState,
    pub calls: CallSlotController,
    pub clock: Arc<dyn Clock>,
    leader: AtomicBool,
    reflection_queue_dry: AtomicBool,
}

impl TaskServices {
    pub fn new(
        identity: IdentityString,
        device_id: DeviceId,
        keys: DeviceGroupKeys,
        scheduler: TaskScheduler,
        state: PersistentProtocolState,
    ) -> Self {
        let nonces = NonceService::new(identity.as_str(), Arc::new(MemoryNonceStore::new()));
        Self {
            identity,
            device_id,
            keys,
            nonces,
            model: Model::default(),
            ledger: DistributionLedger::default(),
            scheduler,
            state,
            calls: CallSlotController::new(),
            clock: Arc::new(SystemClock),
            leader: AtomicBool::new(false),
            reflection_queue_dry: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_nonce_store(mut self, store: Arc<dyn NonceStore>) -> Self {
        self.nonces = NonceService::new(self.identity.as_str(), store);
        self
    }

    pub fn with_ledger(mut self, ledger: DistributionLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Whether this device currently talks to the chat server.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub fn is_reflection_queue_dry(&self) -> bool {
        self.reflection_queue_dry.load(Ordering::Acquire)
    }

    pub(crate) fn mark_leader(&self) {
        self.leader.store(true, Ordering::Release);
    }

    pub(crate) fn mark_reflection_queue_dry(&self) {
        self.reflection_queue_dry.store(true, Ordering::Release);
    }

    /// Forget per-connection flags after a disconnect.
    pub fn reset_connection_flags(&self) {
        self.leader.store(false, Ordering::Release);
        self.reflection_queue_dry.store(false, Ordering::Release);
    }
}
