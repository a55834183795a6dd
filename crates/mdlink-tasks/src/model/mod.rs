//! In-memory models, mutated only through their controllers.

pub mod contacts;
pub mod devices;
pub mod messages;
pub mod profile;
pub mod settings;

use mdlink_proto::csp;
use mdlink_protocol::IdentityString;

use crate::dispatch::DispatchError;

pub use contacts::{ContactChange, ContactUpdate, ContactView, Contacts};
pub use devices::{DeviceView, Devices};
pub use messages::{Direction, MessageView, Messages};
pub use profile::{Profile, ProfilePictureShareWith, ProfileView};
pub use settings::{Settings, SettingsUpdate};

#[derive(Default)]
pub struct Model {
    pub messages: Messages,
    pub contacts: Contacts,
    pub profile: Profile,
    pub devices: Devices,
    pub settings: Settings,
}

impl Model {
    /// Whether `contact` gets read receipts, after their override.
    pub fn sends_read_receipts(&self, contact: &IdentityString) -> bool {
        self.contacts
            .get(contact)
            .and_then(|view| view.read_receipts)
            .unwrap_or_else(|| self.settings.read_receipts())
    }

    /// Whether `contact` gets typing indicators, after their override.
    pub fn sends_typing_indicators(&self, contact: &IdentityString) -> bool {
        self.contacts
            .get(contact)
            .and_then(|view| view.typing_indicators)
            .unwrap_or_else(|| self.settings.typing_indicators())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReactionAction {
    Apply(String),
    Withdraw(String),
}

impl ReactionAction {
    pub fn from_proto(action: Option<csp::reaction::Action>) -> Result<Self, DispatchError> {
        match action {
            Some(csp::reaction::Action::Apply(emoji)) => Ok(ReactionAction::Apply(emoji)),
            Some(csp::reaction::Action::Withdraw(emoji)) => Ok(ReactionAction::Withdraw(emoji)),
            None => Err(DispatchError::Invalid("reaction without action".into())),
        }
    }

    pub fn to_proto(&self) -> csp::reaction::Action {
        match self {
            ReactionAction::Apply(emoji) => csp::reaction::Action::Apply(emoji.clone()),
            ReactionAction::Withdraw(emoji) => csp::reaction::Action::Withdraw(emoji.clone()),
        }
    }
}

/// Parse an identity carried in a protobuf field.
pub(crate) fn parse_identity(field: &'static str, value: &str) -> Result<IdentityString, DispatchError> {
    value
        .parse()
        .map_err(|_| DispatchError::Invalid(format!("{field} {value:?}")))
}
