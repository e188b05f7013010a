//! Status state machine for data peers.
//!
//! A connected directory server is always in one of the [`ServerStatus`]
//! values. Status moves only through [`compute_new_status`]; an illegal
//! transition yields [`ServerStatus::Invalid`] and the caller must keep the
//! previous status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a directory server as seen by its replication server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Not connected to any replication server.
    NotConnected,
    /// Connected and keeping up with the topology.
    Normal,
    /// Connected but lagging behind (too many pending changes).
    Degraded,
    /// Being re-initialized with a full update.
    FullUpdate,
    /// Generation id differs from the domain's reference.
    BadGenerationId,
    /// Result of an illegal transition; never stored on a peer.
    Invalid,
}

impl ServerStatus {
    /// Statuses a directory server may announce when it connects.
    pub fn is_valid_initial(&self) -> bool {
        matches!(self, Self::Normal | Self::Degraded | Self::BadGenerationId)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotConnected => "not-connected",
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::FullUpdate => "full-update",
            Self::BadGenerationId => "bad-generation-id",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Events driving status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusEvent {
    /// Connection lost or closed.
    ToNotConnected,
    /// Backlog drained, or explicit request.
    ToNormal,
    /// Backlog above the degraded threshold.
    ToDegraded,
    /// Full update engaged.
    ToFullUpdate,
    /// Generation id mismatch detected.
    ToBadGenerationId,
}

/// Translate a requested status into the event that reaches it.
///
/// Returns `None` for [`ServerStatus::Invalid`], which no event produces.
pub fn status_to_event(status: ServerStatus) -> Option<StatusEvent> {
    match status {
        ServerStatus::NotConnected => Some(StatusEvent::ToNotConnected),
        ServerStatus::Normal => Some(StatusEvent::ToNormal),
        ServerStatus::Degraded => Some(StatusEvent::ToDegraded),
        ServerStatus::FullUpdate => Some(StatusEvent::ToFullUpdate),
        ServerStatus::BadGenerationId => Some(StatusEvent::ToBadGenerationId),
        ServerStatus::Invalid => None,
    }
}

/// Compute the status reached from `current` when `event` occurs.
///
/// The normal/degraded toggles only apply between `Normal` and `Degraded`
/// (and from `NotConnected`); `FullUpdate` and `BadGenerationId` can only be
/// left through a full update or a disconnection.
pub fn compute_new_status(current: ServerStatus, event: StatusEvent) -> ServerStatus {
    use ServerStatus as S;
    use StatusEvent as E;

    match (current, event) {
        (S::Invalid, _) => S::Invalid,
        (_, E::ToNotConnected) => S::NotConnected,

        (S::NotConnected, E::ToNormal) => S::Normal,
        (S::NotConnected, E::ToDegraded) => S::Degraded,
        (S::NotConnected, E::ToBadGenerationId) => S::BadGenerationId,
        (S::NotConnected, E::ToFullUpdate) => S::Invalid,

        (S::Normal | S::Degraded, E::ToNormal) => S::Normal,
        (S::Normal | S::Degraded, E::ToDegraded) => S::Degraded,
        (S::Normal | S::Degraded, E::ToFullUpdate) => S::FullUpdate,
        (S::Normal | S::Degraded, E::ToBadGenerationId) => S::BadGenerationId,

        (S::FullUpdate, E::ToFullUpdate) => S::FullUpdate,
        (S::FullUpdate, _) => S::Invalid,

        (S::BadGenerationId, E::ToFullUpdate) => S::FullUpdate,
        (S::BadGenerationId, E::ToBadGenerationId) => S::BadGenerationId,
        (S::BadGenerationId, _) => S::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerStatus as S;
    use StatusEvent as E;

    const ALL_EVENTS: [StatusEvent; 5] = [
        E::ToNotConnected,
        E::ToNormal,
        E::ToDegraded,
        E::ToFullUpdate,
        E::ToBadGenerationId,
    ];

    #[test]
    fn test_normal_degraded_toggle() {
        assert_eq!(compute_new_status(S::Normal, E::ToDegraded), S::Degraded);
        assert_eq!(compute_new_status(S::Degraded, E::ToNormal), S::Normal);
        assert_eq!(compute_new_status(S::Normal, E::ToNormal), S::Normal);
    }

    #[test]
    fn test_full_update_cannot_toggle() {
        assert_eq!(compute_new_status(S::FullUpdate, E::ToDegraded), S::Invalid);
        assert_eq!(compute_new_status(S::FullUpdate, E::ToNormal), S::Invalid);
        assert_eq!(compute_new_status(S::FullUpdate, E::ToBadGenerationId), S::Invalid);
        assert_eq!(compute_new_status(S::FullUpdate, E::ToFullUpdate), S::FullUpdate);
    }

    #[test]
    fn test_bad_generation_exits() {
        assert_eq!(compute_new_status(S::BadGenerationId, E::ToNormal), S::Invalid);
        assert_eq!(compute_new_status(S::BadGenerationId, E::ToDegraded), S::Invalid);
        assert_eq!(
            compute_new_status(S::BadGenerationId, E::ToFullUpdate),
            S::FullUpdate
        );
    }

    #[test]
    fn test_disconnect_always_allowed() {
        for status in [S::NotConnected, S::Normal, S::Degraded, S::FullUpdate, S::BadGenerationId] {
            assert_eq!(compute_new_status(status, E::ToNotConnected), S::NotConnected);
        }
    }

    #[test]
    fn test_not_connected_cannot_start_full_update() {
        assert_eq!(compute_new_status(S::NotConnected, E::ToFullUpdate), S::Invalid);
    }

    #[test]
    fn test_invalid_is_absorbing() {
        for event in ALL_EVENTS {
            assert_eq!(compute_new_status(S::Invalid, event), S::Invalid);
        }
    }

    #[test]
    fn test_status_to_event_round_trip() {
        for event in ALL_EVENTS {
            let reached = compute_new_status(S::Normal, event);
            if reached != S::Invalid {
                assert_eq!(status_to_event(reached), Some(event));
            }
        }
        assert_eq!(status_to_event(S::Invalid), None);
    }

    #[test]
    fn test_valid_initial_statuses() {
        assert!(S::Normal.is_valid_initial());
        assert!(S::Degraded.is_valid_initial());
        assert!(S::BadGenerationId.is_valid_initial());
        assert!(!S::FullUpdate.is_valid_initial());
        assert!(!S::NotConnected.is_valid_initial());
    }
}
