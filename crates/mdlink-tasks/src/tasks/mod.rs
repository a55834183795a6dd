//! Concrete protocol flows run by the task manager.

mod devices_info;
mod drop_device;
mod incoming_message;
mod outgoing_message;
mod profile_distribution;
mod reflected;
mod sync;
mod typing;

pub use devices_info::DevicesInfoTask;
pub use drop_device::DropDeviceTask;
pub use incoming_message::IncomingMessageTask;
pub use outgoing_message::{
    MAX_RECEIPT_IDS, OutgoingCspMessageTask, OutgoingDeliveryReceiptTask, ReflectReadTask,
};
pub use profile_distribution::ProfilePictureDistributionStep;
pub use reflected::ReflectedTask;
pub use sync::{ContactSyncTask, SettingsSyncTask, UserProfileSyncTask};
pub use typing::{IncomingTypingIndicatorTask, OutgoingTypingIndicatorTask};
