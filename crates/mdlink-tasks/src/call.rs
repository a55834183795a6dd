//! Ownership of the single call slot.
//!
//! At most one call is ongoing at any time: either a 1:1 call with a contact
//! or a group call. Every decision about the slot goes through an
//! [`AsyncLock`], so two racing attempts to start a call cannot both win.

use mdlink_protocol::IdentityString;
use thiserror::Error;

use crate::lock::AsyncLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OngoingCall {
    OneToOne {
        contact: IdentityString,
        call_id: u32,
    },
    Group {
        call_id: [u8; 32],
    },
}

/// Who is deciding about the slot, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSlotContext {
    StartOneToOne,
    JoinGroup,
    End,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("another call is ongoing: {0:?}")]
    SlotOccupied(OngoingCall),

    #[error("call is not the ongoing call")]
    NotOngoing,
}

pub struct CallSlotController {
    slot: AsyncLock<CallSlotContext, Option<OngoingCall>>,
}

impl Default for CallSlotController {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSlotController {
    pub fn new() -> Self {
        Self {
            slot: AsyncLock::new(None),
        }
    }

    pub fn current(&self) -> Option<OngoingCall> {
        self.slot.snapshot()
    }

    pub async fn start_one_to_one(
        &self,
        contact: IdentityString,
        call_id: u32,
    ) -> Result<(), CallError> {
        self.occupy(
            CallSlotContext::StartOneToOne,
            OngoingCall::OneToOne { contact, call_id },
        )
        .await
    }

    /// Take the slot for a group call, identified by its derived call id.
    pub async fn join_group(&self, call_id: [u8; 32]) -> Result<(), CallError> {
        self.occupy(CallSlotContext::JoinGroup, OngoingCall::Group { call_id })
            .await
    }

    /// Release the slot held by `call`.
    pub async fn end(&self, call: &OngoingCall) -> Result<(), CallError> {
        self.slot
            .with(Some(CallSlotContext::End), |current| async move {
                match current {
                    Some(ongoing) if &ongoing == call => {
                        tracing::info!(call = ?ongoing, "call ended");
                        Ok((None, ()))
                    }
                    _ => Err(CallError::NotOngoing),
                }
            })
            .await
    }

    async fn occupy(&self, context: CallSlotContext, call: OngoingCall) -> Result<(), CallError> {
        self.slot
            .with(Some(context), |current| async move {
                if let Some(ongoing) = current {
                    return Err(CallError::SlotOccupied(ongoing));
                }
                tracing::info!(call = ?call, "call started");
                Ok((Some(call), ()))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn contact() -> IdentityString {
        "ECHOECHO".parse().unwrap()
    }

    #[tokio::test]
    async fn one_call_at_a_time() {
        let calls = CallSlotController::new();
        calls.start_one_to_one(contact(), 7).await.unwrap();

        let err = calls.join_group([1; 32]).await.unwrap_err();
        assert!(matches!(err, CallError::SlotOccupied(OngoingCall::OneToOne { call_id: 7, .. })));

        let ongoing = calls.current().unwrap();
        calls.end(&ongoing).await.unwrap();
        assert_eq!(calls.current(), None);

        calls.join_group([1; 32]).await.unwrap();
        assert_eq!(calls.current(), Some(OngoingCall::Group { call_id: [1; 32] }));
    }

    #[tokio::test]
    async fn ending_another_call_fails() {
        let calls = CallSlotController::new();
        calls.join_group([2; 32]).await.unwrap();
        let other = OngoingCall::Group { call_id: [3; 32] };
        assert_eq!(calls.end(&other).await, Err(CallError::NotOngoing));
        assert!(calls.current().is_some());
    }

    #[tokio::test]
    async fn racing_starts_have_one_winner() {
        let calls = Arc::new(CallSlotController::new());
        let a = {
            let calls = Arc::clone(&calls);
            tokio::spawn(async move { calls.start_one_to_one(contact(), 1).await })
        };
        let b = {
            let calls = Arc::clone(&calls);
            tokio::spawn(async move { calls.join_group([9; 32]).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    }
}
