//! # Microphone Arbitrator
//!
//! Grants exclusive ownership of the capture device to at most one feature at a time.
//! Conversation mode and text-input dictation both want the microphone; whichever
//! acquires the lease first keeps it until it releases explicitly or is force-cleaned.
//!
//! ## Lease Model:
//! - **acquire(owner)**: returns a [`MicrophoneLease`] or [`LeaseDenied`] when someone else holds it
//! - **release(owner)**: releases whatever lease that owner tag holds (idempotent)
//! - **release_lease(lease)**: releases only if that exact lease is still current (idempotent)
//!
//! ## Why an object instead of a global:
//! The arbitrator is created once by the application state and handed to every feature
//! that needs it. Tests build their own isolated instances.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The feature asking for the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerTag {
    /// Full-duplex voice conversation (the turn controller)
    Conversation,
    /// One-shot dictation into the chat text input
    Dictation,
}

impl OwnerTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerTag::Conversation => "conversation",
            OwnerTag::Dictation => "dictation",
        }
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof of exclusive microphone ownership.
///
/// Each grant gets a fresh id, so a lease kept around after it was released
/// can never be mistaken for a newer grant to the same owner tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MicrophoneLease {
    id: Uuid,
    owner: OwnerTag,
    granted_at: DateTime<Utc>,
}

impl MicrophoneLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> OwnerTag {
        self.owner
    }

    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }
}

/// Returned when the microphone is already leased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseDenied {
    pub requested_by: OwnerTag,
    pub held_by: OwnerTag,
}

impl fmt::Display for LeaseDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "microphone requested by {} is held by {}",
            self.requested_by, self.held_by
        )
    }
}

impl std::error::Error for LeaseDenied {}

/// Injectable resource manager for the capture device.
///
/// ## Thread Safety:
/// Clones share the same slot (`Arc<Mutex<_>>`). The lock is only held for the
/// duration of a compare-and-set, never across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct MicrophoneArbitrator {
    current: Arc<Mutex<Option<MicrophoneLease>>>,
}

impl MicrophoneArbitrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<MicrophoneLease>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Try to take the microphone for `owner`.
    ///
    /// Never steals: if any lease is outstanding, including one held by the
    /// same owner tag, the request is denied.
    pub fn acquire(&self, owner: OwnerTag) -> Result<MicrophoneLease, LeaseDenied> {
        let mut slot = self.slot();

        if let Some(held) = slot.as_ref() {
            warn!(requested_by = %owner, held_by = %held.owner, "Microphone lease denied");
            return Err(LeaseDenied {
                requested_by: owner,
                held_by: held.owner,
            });
        }

        let lease = MicrophoneLease {
            id: Uuid::new_v4(),
            owner,
            granted_at: Utc::now(),
        };
        *slot = Some(lease.clone());

        info!(owner = %owner, lease_id = %lease.id, "Microphone lease granted");
        Ok(lease)
    }

    /// Release whatever lease `owner` holds. Releasing a lease that is not
    /// held (or held by someone else) is a no-op.
    pub fn release(&self, owner: OwnerTag) {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(held) if held.owner == owner => {
                info!(owner = %owner, lease_id = %held.id, "Microphone lease released");
                *slot = None;
            }
            _ => debug!(owner = %owner, "Release ignored, owner holds no lease"),
        }
    }

    /// Release `lease` only if it is still the current grant.
    pub fn release_lease(&self, lease: &MicrophoneLease) {
        let mut slot = self.slot();
        if slot.as_ref().map(|held| held.id) == Some(lease.id) {
            info!(owner = %lease.owner, lease_id = %lease.id, "Microphone lease released");
            *slot = None;
        } else {
            debug!(lease_id = %lease.id, "Release ignored, lease no longer current");
        }
    }

    /// Whether `lease` is still the outstanding grant.
    pub fn is_held(&self, lease: &MicrophoneLease) -> bool {
        self.slot().as_ref().map(|held| held.id) == Some(lease.id)
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<OwnerTag> {
        self.slot().as_ref().map(|held| held.owner)
    }

    pub fn current_lease(&self) -> Option<MicrophoneLease> {
        self.slot().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let arbitrator = MicrophoneArbitrator::new();
        let lease = arbitrator.acquire(OwnerTag::Conversation).unwrap();

        assert_eq!(lease.owner(), OwnerTag::Conversation);
        assert_eq!(arbitrator.holder(), Some(OwnerTag::Conversation));
        assert!(arbitrator.is_held(&lease));

        arbitrator.release(OwnerTag::Conversation);
        assert_eq!(arbitrator.holder(), None);
        assert!(!arbitrator.is_held(&lease));
    }

    #[test]
    fn test_second_owner_is_denied() {
        let arbitrator = MicrophoneArbitrator::new();
        let _lease = arbitrator.acquire(OwnerTag::Conversation).unwrap();

        let denied = arbitrator.acquire(OwnerTag::Dictation).unwrap_err();
        assert_eq!(denied.requested_by, OwnerTag::Dictation);
        assert_eq!(denied.held_by, OwnerTag::Conversation);

        // Same tag does not get a second lease either
        assert!(arbitrator.acquire(OwnerTag::Conversation).is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let arbitrator = MicrophoneArbitrator::new();
        arbitrator.release(OwnerTag::Dictation);

        let lease = arbitrator.acquire(OwnerTag::Dictation).unwrap();
        arbitrator.release_lease(&lease);
        arbitrator.release_lease(&lease);
        arbitrator.release(OwnerTag::Dictation);

        assert_eq!(arbitrator.holder(), None);
        assert!(arbitrator.acquire(OwnerTag::Conversation).is_ok());
    }

    #[test]
    fn test_release_by_other_owner_is_ignored() {
        let arbitrator = MicrophoneArbitrator::new();
        let _lease = arbitrator.acquire(OwnerTag::Conversation).unwrap();

        arbitrator.release(OwnerTag::Dictation);
        assert_eq!(arbitrator.holder(), Some(OwnerTag::Conversation));
    }

    #[test]
    fn test_stale_lease_does_not_release_newer_grant() {
        let arbitrator = MicrophoneArbitrator::new();
        let old = arbitrator.acquire(OwnerTag::Conversation).unwrap();
        arbitrator.release_lease(&old);

        let new = arbitrator.acquire(OwnerTag::Conversation).unwrap();
        arbitrator.release_lease(&old);

        assert!(arbitrator.is_held(&new));
        assert_ne!(old.id(), new.id());
    }

    #[test]
    fn test_instances_are_isolated() {
        let first = MicrophoneArbitrator::new();
        let second = MicrophoneArbitrator::new();

        let _lease = first.acquire(OwnerTag::Conversation).unwrap();
        assert!(second.acquire(OwnerTag::Dictation).is_ok());

        // Clones share the slot
        let shared = first.clone();
        assert_eq!(shared.holder(), Some(OwnerTag::Conversation));
    }
}
