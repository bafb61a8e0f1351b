//! State digest submission.
//!
//! The verifier never compares digests; the relay does. Each peer records the digest of
//! its state after every executed step and submits it when the relay asks for that frame,
//! or on its own schedule when [`VerificationMode::Every`] is configured.
//!
//! A request can reach a peer before it has stepped to the requested frame, so requests
//! for frames not yet reached are remembered and answered right after the step that
//! produces them. The most recent digests are retained so that a request arriving just
//! after the step can still be answered.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::checksum::StateDigest;
use crate::network::messages::OutboundMessage;
use crate::report_violation_to;
use crate::sessions::config::VerificationMode;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, PeerId, SessionId};

/// Number of recent digests retained for late verification requests.
pub const RETAINED_DIGESTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordedDigest {
    frame: Frame,
    digest: StateDigest,
    submitted: bool,
}

/// Answers the relay's verification requests.
pub struct StateVerifier {
    session_id: SessionId,
    local: PeerId,
    mode: VerificationMode,
    recent: VecDeque<RecordedDigest>,
    pending: BTreeSet<Frame>,
    paused: bool,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for StateVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateVerifier")
            .field("local", &self.local)
            .field("mode", &self.mode)
            .field("recent", &self.recent)
            .field("pending", &self.pending)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl StateVerifier {
    /// Creates a verifier with nothing recorded.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        local: PeerId,
        mode: VerificationMode,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            session_id,
            local,
            mode,
            recent: VecDeque::with_capacity(RETAINED_DIGESTS),
            pending: BTreeSet::new(),
            paused: false,
            violation_observer,
        }
    }

    /// Returns `true` if the configured cadence submits `frame` unasked.
    #[must_use]
    pub fn should_verify(&self, frame: Frame) -> bool {
        self.mode.should_verify(frame)
    }

    /// Records the digest of the state at `frame`, right after the step that produced it.
    ///
    /// Returns a submission if the relay already asked for this frame or the cadence
    /// calls for it.
    pub fn record<A, S>(
        &mut self,
        frame: Frame,
        digest: StateDigest,
    ) -> Option<OutboundMessage<A, S>> {
        if self.recent.len() == RETAINED_DIGESTS {
            self.recent.pop_front();
        }
        self.recent.push_back(RecordedDigest {
            frame,
            digest,
            submitted: false,
        });
        trace!(%frame, %digest, "digest recorded");

        let requested = self.pending.remove(&frame);
        if self.paused || !(requested || self.should_verify(frame)) {
            return None;
        }
        self.submit_latest()
    }

    /// Records a digest that must never be submitted on its own, such as the state a
    /// snapshot restored.
    pub fn remember(&mut self, frame: Frame, digest: StateDigest) {
        self.recent.clear();
        self.recent.push_back(RecordedDigest {
            frame,
            digest,
            submitted: true,
        });
    }

    /// Handles the relay's request to verify `frame`.
    ///
    /// `current` is the local frame and `step_outstanding` tells whether the joint action
    /// that leads to `frame` has been announced but not yet executed. An outstanding step
    /// always defers the request, even if an older episode left a digest for the same frame
    /// number. Otherwise the newest retained digest for `frame` is submitted, and a frame
    /// not reached yet is deferred until [`record`](Self::record) produces it. Requests are
    /// skipped while paused.
    pub fn on_verification_requested<A, S>(
        &mut self,
        frame: Frame,
        current: Frame,
        step_outstanding: bool,
    ) -> Option<OutboundMessage<A, S>> {
        if self.paused {
            debug!(%frame, "verification request skipped while paused");
            return None;
        }
        if step_outstanding {
            trace!(%frame, "verification request deferred until the announced step");
            self.pending.insert(frame);
            return None;
        }
        if let Some(index) = self.recent.iter().rposition(|entry| entry.frame == frame) {
            return self.submit_at(index);
        }
        if frame > current {
            trace!(%frame, %current, "verification request deferred");
            self.pending.insert(frame);
            return None;
        }
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Warning,
            ViolationKind::StateVerification,
            "verification requested for frame {} but no digest is retained (current frame {})",
            frame,
            current
        );
        None
    }

    /// Suspends or resumes submission. Pausing forgets deferred requests.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        if paused {
            self.pending.clear();
        }
    }

    /// Returns `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The most recently recorded digest.
    #[must_use]
    pub fn latest(&self) -> Option<(Frame, StateDigest)> {
        self.recent.back().map(|entry| (entry.frame, entry.digest))
    }

    /// Frames the relay asked about that have not been reached yet.
    pub fn pending(&self) -> impl Iterator<Item = Frame> + '_ {
        self.pending.iter().copied()
    }

    fn submit_latest<A, S>(&mut self) -> Option<OutboundMessage<A, S>> {
        let index = self.recent.len().checked_sub(1)?;
        self.submit_at(index)
    }

    fn submit_at<A, S>(&mut self, index: usize) -> Option<OutboundMessage<A, S>> {
        let entry = self.recent.get_mut(index)?;
        if entry.submitted {
            trace!(frame = %entry.frame, "digest already submitted");
            return None;
        }
        entry.submitted = true;
        debug!(frame = %entry.frame, digest = %entry.digest, "submitting state digest");
        Some(OutboundMessage::SubmitStateDigest {
            session_id: self.session_id.clone(),
            peer_id: self.local.clone(),
            digest: entry.digest,
            frame: entry.frame,
        })
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

    type Outbound = Option<OutboundMessage<u8, ()>>;

    fn verifier(mode: VerificationMode) -> (StateVerifier, Arc<CollectingObserver>) {
        let observer = Arc::new(CollectingObserver::new());
        let verifier = StateVerifier::new(
            SessionId::from("s"),
            PeerId::from("p1"),
            mode,
            Some(observer.clone()),
        );
        (verifier, observer)
    }

    fn digest(n: u128) -> StateDigest {
        StateDigest::new(n)
    }

    fn submitted_frame(msg: Outbound) -> Option<Frame> {
        match msg {
            Some(OutboundMessage::SubmitStateDigest { frame, .. }) => Some(frame),
            _ => None,
        }
    }

    #[test]
    fn request_after_step_is_answered_from_history() {
        let (mut v, _) = verifier(VerificationMode::Off);
        let none: Outbound = v.record(Frame::new(1), digest(1));
        assert!(none.is_none());
        let msg: Outbound = v.on_verification_requested(Frame::new(1), Frame::new(1), false);
        assert_eq!(
            msg,
            Some(OutboundMessage::SubmitStateDigest {
                session_id: SessionId::from("s"),
                peer_id: PeerId::from("p1"),
                digest: digest(1),
                frame: Frame::new(1),
            })
        );
    }

    #[test]
    fn request_before_step_is_deferred() {
        let (mut v, _) = verifier(VerificationMode::Off);
        let early: Outbound = v.on_verification_requested(Frame::new(3), Frame::new(2), true);
        assert!(early.is_none());
        assert_eq!(v.pending().collect::<Vec<_>>(), vec![Frame::new(3)]);
        let msg: Outbound = v.record(Frame::new(3), digest(3));
        assert_eq!(submitted_frame(msg), Some(Frame::new(3)));
        assert_eq!(v.pending().count(), 0);
    }

    #[test]
    fn outstanding_step_wins_over_older_history() {
        let (mut v, _) = verifier(VerificationMode::Off);
        // an earlier episode reached frame 2 as well
        let _: Outbound = v.record(Frame::new(2), digest(20));
        let _: Outbound = v.record(Frame::new(1), digest(1));
        let deferred: Outbound = v.on_verification_requested(Frame::new(2), Frame::new(1), true);
        assert!(deferred.is_none());
        let msg: Outbound = v.record(Frame::new(2), digest(2));
        match msg {
            Some(OutboundMessage::SubmitStateDigest { digest: d, .. }) => assert_eq!(d, digest(2)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn submissions_are_deduplicated() {
        let (mut v, _) = verifier(VerificationMode::Every { interval: 1 });
        let first: Outbound = v.record(Frame::new(1), digest(1));
        assert!(first.is_some());
        let second: Outbound = v.on_verification_requested(Frame::new(1), Frame::new(1), false);
        assert!(second.is_none());
    }

    #[test]
    fn cadence_submits_unasked() {
        let (mut v, _) = verifier(VerificationMode::Every { interval: 2 });
        let one: Outbound = v.record(Frame::new(1), digest(1));
        let two: Outbound = v.record(Frame::new(2), digest(2));
        assert!(one.is_none());
        assert_eq!(submitted_frame(two), Some(Frame::new(2)));
    }

    #[test]
    fn forgotten_frame_is_reported() {
        let (mut v, observer) = verifier(VerificationMode::Off);
        for f in 1..=(RETAINED_DIGESTS as i32 + 1) {
            let _: Outbound = v.record(Frame::new(f), digest(f as u128));
        }
        let msg: Outbound = v.on_verification_requested(Frame::new(1), Frame::new(5), false);
        assert!(msg.is_none());
        assert!(observer.has_violation(ViolationKind::StateVerification));
    }

    #[test]
    fn paused_verifier_skips_and_forgets() {
        let (mut v, _) = verifier(VerificationMode::Off);
        let _: Outbound = v.on_verification_requested(Frame::new(4), Frame::new(3), true);
        v.set_paused(true);
        assert_eq!(v.pending().count(), 0);
        let msg: Outbound = v.on_verification_requested(Frame::new(3), Frame::new(3), false);
        assert!(msg.is_none());
        v.set_paused(false);
        let msg: Outbound = v.record(Frame::new(4), digest(4));
        assert!(msg.is_none());
    }

    #[test]
    fn remembered_digest_is_not_resubmitted() {
        let (mut v, _) = verifier(VerificationMode::Off);
        let _: Outbound = v.record(Frame::new(9), digest(9));
        v.remember(Frame::new(10), digest(100));
        assert_eq!(v.latest(), Some((Frame::new(10), digest(100))));
        let msg: Outbound = v.on_verification_requested(Frame::new(10), Frame::new(10), false);
        assert!(msg.is_none());
    }
}
