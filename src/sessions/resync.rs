//! Pause and full-state resynchronization.
//!
//! ```text
//!            DivergenceDetected                RequestSnapshot (host)
//!   Active ──────────────────────► Paused ───────────────────────► Resyncing
//!     ▲                              │  ApplySnapshot (peer)           │
//!     │                              ▼                                 │
//!     └──────────── applied ◄──── Resyncing          resume (host) ────┘
//! ```
//!
//! The host serves its own state and never applies a snapshot. Peers apply the host's
//! snapshot all-or-nothing; a rejected snapshot leaves them paused until the next one.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::network::messages::OutboundMessage;
use crate::report_violation_to;
use crate::runner::DeterministicEnvironmentRunner;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Config, Frame, FullSnapshot, SessionId};

/// Where the local peer stands in the resync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResyncState {
    /// Stepping normally.
    #[default]
    Active,
    /// A divergence was reported at `frame`; nothing advances.
    Paused {
        /// The frame of the divergence.
        frame: Frame,
    },
    /// A snapshot is being served (host) or applied (peer).
    Resyncing {
        /// The frame of the divergence.
        frame: Frame,
    },
}

impl ResyncState {
    /// Returns `true` for [`ResyncState::Active`].
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// The divergence frame, unless active.
    #[must_use]
    pub const fn frame(self) -> Option<Frame> {
        match self {
            Self::Active => None,
            Self::Paused { frame } | Self::Resyncing { frame } => Some(frame),
        }
    }
}

/// What happened to an inbound snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The snapshot was not meant for this peer.
    Ignored,
    /// The snapshot was applied; stepping resumes from `frame`.
    Applied {
        /// The snapshot's frame.
        frame: Frame,
    },
    /// The snapshot failed validation. The peer stays paused.
    Rejected {
        /// The frame of the divergence.
        frame: Frame,
        /// Why it was rejected.
        reason: String,
    },
}

/// Drives the `Active → Paused → Resyncing → Active` cycle.
pub struct ResyncManager {
    session_id: SessionId,
    state: ResyncState,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for ResyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncManager")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ResyncManager {
    /// Creates an active manager.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            session_id,
            state: ResyncState::Active,
            violation_observer,
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ResyncState {
        self.state
    }

    /// Returns `true` while stepping is allowed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Pauses for a divergence at `frame`.
    ///
    /// A repeated report for the divergence already being handled is ignored. Returns
    /// `true` if the state changed.
    pub fn on_divergence(&mut self, frame: Frame) -> bool {
        if self.state.frame() == Some(frame) {
            debug!(%frame, state = ?self.state, "divergence already being handled");
            return false;
        }
        warn!(%frame, "divergence detected; pausing");
        self.state = ResyncState::Paused { frame };
        true
    }

    /// Serves the host's full state.
    ///
    /// A request that arrives before the divergence notice pauses implicitly. Returns the
    /// response to send, or `None` if this peer must not or could not serve.
    pub fn on_snapshot_requested<T: Config>(
        &mut self,
        frame: Frame,
        is_host: bool,
        runner: &DeterministicEnvironmentRunner<T>,
    ) -> Option<OutboundMessage<T::Action, T::EnvState>> {
        if !is_host {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Snapshot,
                "snapshot requested for frame {} from a peer that is not host",
                frame
            );
            return None;
        }
        let pause_frame = self.state.frame().unwrap_or(frame);
        match runner.snapshot() {
            Ok(snapshot) => {
                info!(
                    requested = %frame,
                    snapshot_frame = %snapshot.frame,
                    seal = %snapshot.seal_digest(),
                    "serving snapshot"
                );
                self.state = ResyncState::Resyncing { frame: pause_frame };
                Some(OutboundMessage::SnapshotResponse {
                    session_id: self.session_id.clone(),
                    snapshot,
                })
            },
            Err(err) => {
                error!(%frame, %err, "failed to capture snapshot");
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Snapshot,
                    "snapshot for frame {} could not be captured: {}",
                    frame,
                    err
                );
                self.state = ResyncState::Paused { frame: pause_frame };
                None
            },
        }
    }

    /// Applies the host's snapshot on a non-host peer.
    pub fn on_apply_snapshot<T: Config>(
        &mut self,
        snapshot: &FullSnapshot<T::EnvState>,
        is_host: bool,
        runner: &mut DeterministicEnvironmentRunner<T>,
    ) -> ApplyOutcome {
        if is_host {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Snapshot,
                "host received a snapshot for frame {}; ignoring",
                snapshot.frame
            );
            return ApplyOutcome::Ignored;
        }
        let pause_frame = self.state.frame().unwrap_or(snapshot.frame);
        self.state = ResyncState::Resyncing { frame: pause_frame };
        match runner.apply_snapshot(snapshot) {
            Ok(()) => {
                info!(frame = %snapshot.frame, "snapshot applied; resuming");
                self.state = ResyncState::Active;
                ApplyOutcome::Applied {
                    frame: snapshot.frame,
                }
            },
            Err(err) => {
                error!(frame = %pause_frame, %err, "snapshot rejected; staying paused");
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Snapshot,
                    "snapshot for frame {} rejected: {}",
                    snapshot.frame,
                    err
                );
                self.state = ResyncState::Paused { frame: pause_frame };
                ApplyOutcome::Rejected {
                    frame: pause_frame,
                    reason: err.to_string(),
                }
            },
        }
    }

    /// Returns the host to active after it served a snapshot. Returns `true` if it did.
    pub fn resume(&mut self) -> bool {
        match self.state {
            ResyncState::Resyncing { frame } => {
                info!(%frame, "resuming after serving snapshot");
                self.state = ResyncState::Active;
                true
            },
            _ => false,
        }
    }

    /// Abandons a resync in progress because the host changed. Stays paused for the same
    /// frame so the new host can serve the next request.
    pub fn abandon(&mut self) {
        if let ResyncState::Resyncing { frame } = self.state {
            debug!(%frame, "host changed during resync; waiting for a new snapshot");
            self.state = ResyncState::Paused { frame };
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingObserver;

    fn manager() -> (ResyncManager, Arc<CollectingObserver>) {
        let observer = Arc::new(CollectingObserver::new());
        (
            ResyncManager::new(SessionId::from("s"), Some(observer.clone())),
            observer,
        )
    }

    #[test]
    fn divergence_pauses_once() {
        let (mut m, _) = manager();
        assert!(m.on_divergence(Frame::new(10)));
        assert_eq!(m.state(), ResyncState::Paused { frame: Frame::new(10) });
        assert!(!m.on_divergence(Frame::new(10)));
        assert!(!m.is_active());
    }

    #[test]
    fn later_divergence_replaces_the_frame() {
        let (mut m, _) = manager();
        m.on_divergence(Frame::new(10));
        assert!(m.on_divergence(Frame::new(12)));
        assert_eq!(m.state().frame(), Some(Frame::new(12)));
    }

    #[test]
    fn resume_only_from_resyncing() {
        let (mut m, _) = manager();
        assert!(!m.resume());
        m.on_divergence(Frame::new(3));
        assert!(!m.resume());
        m.state = ResyncState::Resyncing { frame: Frame::new(3) };
        assert!(m.resume());
        assert!(m.is_active());
    }

    #[test]
    fn abandon_falls_back_to_paused() {
        let (mut m, _) = manager();
        m.state = ResyncState::Resyncing { frame: Frame::new(8) };
        m.abandon();
        assert_eq!(m.state(), ResyncState::Paused { frame: Frame::new(8) });
        m.abandon();
        assert_eq!(m.state(), ResyncState::Paused { frame: Frame::new(8) });
    }

    #[test]
    fn default_is_active() {
        assert_eq!(ResyncState::default(), ResyncState::Active);
        assert_eq!(ResyncState::Active.frame(), None);
    }
}
