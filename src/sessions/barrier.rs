//! The join-before-advance action barrier.
//!
//! Every peer submits its own action for the current frame and then waits until the relay
//! announces the complete joint action for that frame. Announcements may arrive early, late
//! or out of order; the barrier hands them out strictly in frame order and exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::Poll;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::network::messages::OutboundMessage;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, JointAction, LockstepError, PeerId, SessionId};

/// Collects joint actions announced by the relay and releases them in frame order.
pub struct ActionBarrier<A> {
    session_id: SessionId,
    local: PeerId,
    expected: SmallVec<[PeerId; 4]>,
    /// The next frame [`poll_joint_action`](Self::poll_joint_action) will release.
    awaiting: Frame,
    submitted: Option<Frame>,
    announced: BTreeMap<Frame, JointAction<A>>,
    wait_started: Option<Instant>,
    stall_warning_after: Duration,
    stall_reported: bool,
    paused: bool,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<A> std::fmt::Debug for ActionBarrier<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBarrier")
            .field("local", &self.local)
            .field("expected", &self.expected)
            .field("awaiting", &self.awaiting)
            .field("submitted", &self.submitted)
            .field("buffered", &self.announced.keys().collect::<Vec<_>>())
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl<A: Clone> ActionBarrier<A> {
    /// Creates a barrier waiting for frame 0.
    pub fn new(
        session_id: SessionId,
        local: PeerId,
        expected: impl IntoIterator<Item = PeerId>,
        stall_warning_after: Duration,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            session_id,
            local,
            expected: expected.into_iter().collect(),
            awaiting: Frame::new(0),
            submitted: None,
            announced: BTreeMap::new(),
            wait_started: None,
            stall_warning_after,
            stall_reported: false,
            paused: false,
            violation_observer,
        }
    }

    /// Builds the submission of the local action for `frame`.
    ///
    /// The caller sends the returned message. Starts the stall clock for this frame.
    ///
    /// # Errors
    ///
    /// - [`LockstepError::Paused`] while the barrier is paused.
    /// - [`LockstepError::ActionAlreadySubmitted`] if an action for `frame` was already
    ///   submitted since the last [`clear`](Self::clear).
    pub fn submit_local_action<S>(
        &mut self,
        action: A,
        frame: Frame,
    ) -> Result<OutboundMessage<A, S>, LockstepError> {
        if self.paused {
            return Err(LockstepError::Paused { frame });
        }
        if self.submitted == Some(frame) {
            return Err(LockstepError::ActionAlreadySubmitted { frame });
        }
        self.submitted = Some(frame);
        self.wait_started = Some(Instant::now());
        self.stall_reported = false;
        trace!(peer = %self.local, %frame, "submitting local action");
        Ok(OutboundMessage::SubmitLocalAction {
            session_id: self.session_id.clone(),
            peer_id: self.local.clone(),
            action,
            frame,
        })
    }

    /// Returns `true` if the local action for `frame` has been submitted.
    #[must_use]
    pub fn has_submitted(&self, frame: Frame) -> bool {
        self.submitted == Some(frame)
    }

    /// Stores a joint action announced by the relay.
    ///
    /// Stale and incomplete announcements are dropped and reported. A second announcement
    /// for an already buffered frame is ignored. Returns `true` if the announcement was kept.
    pub fn on_joint_action_ready(&mut self, frame: Frame, joint_action: JointAction<A>) -> bool {
        if frame < self.awaiting {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::ActionBarrier,
                "dropping stale joint action for frame {} while awaiting frame {}",
                frame,
                self.awaiting
            );
            return false;
        }
        let missing = self.missing_peers(&joint_action);
        if !missing.is_empty() {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::ActionBarrier,
                "dropping joint action for frame {} missing peers {:?}",
                frame,
                missing
            );
            return false;
        }
        if self.announced.contains_key(&frame) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::ActionBarrier,
                "duplicate joint action for frame {}; keeping the first",
                frame
            );
            return false;
        }
        trace!(peer = %self.local, %frame, "joint action buffered");
        self.announced.insert(frame, joint_action);
        true
    }

    /// Releases the joint action for `frame` if it has arrived.
    ///
    /// Resolves at most once per frame. Frames before the awaited one never resolve again;
    /// asking for a later frame skips the barrier forward and drops anything older.
    pub fn poll_joint_action(&mut self, frame: Frame) -> Poll<JointAction<A>> {
        if self.paused || frame < self.awaiting {
            return Poll::Pending;
        }
        if frame > self.awaiting {
            debug!(from = %self.awaiting, to = %frame, "barrier skipped forward");
            self.announced = self.announced.split_off(&frame);
            self.awaiting = frame;
        }
        match self.announced.remove(&frame) {
            Some(joint_action) => {
                self.awaiting = frame.next();
                self.wait_started = None;
                self.stall_reported = false;
                Poll::Ready(joint_action)
            },
            None => Poll::Pending,
        }
    }

    /// Returns how long the barrier has been waiting, the first time that exceeds the
    /// configured warning window. Returns `None` on every later call for the same wait.
    pub fn check_stall(&mut self) -> Option<Duration> {
        if self.paused || self.stall_reported {
            return None;
        }
        let waited = self.wait_started?.elapsed();
        if waited < self.stall_warning_after {
            return None;
        }
        self.stall_reported = true;
        warn!(
            peer = %self.local,
            frame = %self.awaiting,
            waited_ms = waited.as_millis(),
            "still waiting for joint action"
        );
        Some(waited)
    }

    /// Drops every buffered announcement and forgets the outstanding submission.
    pub fn clear(&mut self) {
        if !self.announced.is_empty() {
            debug!(dropped = self.announced.len(), "clearing buffered joint actions");
        }
        self.announced.clear();
        self.submitted = None;
        self.wait_started = None;
        self.stall_reported = false;
    }

    /// Clears the barrier and starts waiting for `frame`.
    pub fn reset_to(&mut self, frame: Frame) {
        self.clear();
        self.awaiting = frame;
    }

    /// Suspends or resumes submission and release.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Returns `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Replaces the set of peers a joint action must cover.
    pub fn set_expected_peers(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        self.expected = peers.into_iter().collect();
    }

    /// The peers a joint action must cover.
    #[must_use]
    pub fn expected_peers(&self) -> &[PeerId] {
        &self.expected
    }

    /// The next frame to be released.
    #[must_use]
    pub fn awaiting(&self) -> Frame {
        self.awaiting
    }

    /// Returns `true` if a joint action for `frame` is buffered and not yet released.
    #[must_use]
    pub fn is_announced(&self, frame: Frame) -> bool {
        self.announced.contains_key(&frame)
    }

    /// Number of buffered announcements.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.announced.len()
    }

    fn missing_peers(&self, joint_action: &JointAction<A>) -> Vec<PeerId> {
        self.expected
            .iter()
            .filter(|peer| !joint_action.contains_key(*peer))
            .cloned()
            .collect()
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
    use crate::network::messages::joint_action;
    use crate::telemetry::CollectingObserver;

    type Outbound = OutboundMessage<u8, ()>;

    fn barrier() -> (ActionBarrier<u8>, Arc<CollectingObserver>) {
        let observer = Arc::new(CollectingObserver::new());
        let barrier = ActionBarrier::new(
            SessionId::from("s"),
            PeerId::from("p1"),
            [PeerId::from("p1"), PeerId::from("p2")],
            Duration::from_secs(60),
            Some(observer.clone()),
        );
        (barrier, observer)
    }

    fn joint(a: u8, b: u8) -> JointAction<u8> {
        joint_action([("p1", a), ("p2", b)])
    }

    #[test]
    fn submission_is_tagged_and_single() {
        let (mut barrier, _) = barrier();
        let msg: Outbound = barrier.submit_local_action(4, Frame::new(0)).unwrap();
        assert_eq!(
            msg,
            OutboundMessage::SubmitLocalAction {
                session_id: SessionId::from("s"),
                peer_id: PeerId::from("p1"),
                action: 4,
                frame: Frame::new(0),
            }
        );
        let again: Result<Outbound, _> = barrier.submit_local_action(4, Frame::new(0));
        assert_eq!(
            again,
            Err(LockstepError::ActionAlreadySubmitted {
                frame: Frame::new(0)
            })
        );
    }

    #[test]
    fn resolves_once_per_frame() {
        let (mut barrier, _) = barrier();
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Pending);
        assert!(barrier.on_joint_action_ready(Frame::new(0), joint(0, 1)));
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Ready(joint(0, 1)));
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Pending);
        assert_eq!(barrier.awaiting(), Frame::new(1));
    }

    #[test]
    fn future_frames_wait_their_turn() {
        let (mut barrier, _) = barrier();
        barrier.on_joint_action_ready(Frame::new(1), joint(1, 1));
        barrier.on_joint_action_ready(Frame::new(0), joint(0, 0));
        assert_eq!(barrier.buffered(), 2);
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Ready(joint(0, 0)));
        assert_eq!(barrier.poll_joint_action(Frame::new(1)), Poll::Ready(joint(1, 1)));
        assert_eq!(barrier.buffered(), 0);
    }

    #[test]
    fn stale_announcement_is_reported() {
        let (mut barrier, observer) = barrier();
        barrier.on_joint_action_ready(Frame::new(0), joint(0, 0));
        let _ = barrier.poll_joint_action(Frame::new(0));
        assert!(!barrier.on_joint_action_ready(Frame::new(0), joint(1, 1)));
        assert!(observer.has_violation(ViolationKind::ActionBarrier));
        assert_eq!(barrier.buffered(), 0);
    }

    #[test]
    fn incomplete_announcement_is_dropped() {
        let (mut barrier, observer) = barrier();
        assert!(!barrier.on_joint_action_ready(Frame::new(0), joint_action([("p1", 0u8)])));
        assert_eq!(observer.violations_of_kind(ViolationKind::ActionBarrier).len(), 1);
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Pending);
    }

    #[test]
    fn paused_barrier_neither_submits_nor_releases() {
        let (mut barrier, _) = barrier();
        barrier.on_joint_action_ready(Frame::new(0), joint(0, 0));
        barrier.set_paused(true);
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Pending);
        let submit: Result<Outbound, _> = barrier.submit_local_action(1, Frame::new(0));
        assert!(matches!(submit, Err(LockstepError::Paused { .. })));
    }

    #[test]
    fn clear_forgets_announcements_and_submission() {
        let (mut barrier, _) = barrier();
        let _: Outbound = barrier.submit_local_action(1, Frame::new(0)).unwrap();
        barrier.on_joint_action_ready(Frame::new(0), joint(0, 0));
        barrier.on_joint_action_ready(Frame::new(1), joint(0, 0));
        barrier.clear();
        assert_eq!(barrier.buffered(), 0);
        assert!(!barrier.has_submitted(Frame::new(0)));
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Pending);
    }

    #[test]
    fn reset_rewinds_the_awaited_frame() {
        let (mut barrier, _) = barrier();
        for f in 0..3 {
            barrier.on_joint_action_ready(Frame::new(f), joint(0, 0));
            let _ = barrier.poll_joint_action(Frame::new(f));
        }
        barrier.reset_to(Frame::new(0));
        assert!(barrier.on_joint_action_ready(Frame::new(0), joint(1, 0)));
        assert_eq!(barrier.poll_joint_action(Frame::new(0)), Poll::Ready(joint(1, 0)));
    }

    #[test]
    fn stall_is_reported_once_per_wait() {
        let (mut barrier, _) = barrier();
        barrier.stall_warning_after = Duration::ZERO;
        assert_eq!(barrier.check_stall(), None);
        let _: Outbound = barrier.submit_local_action(1, Frame::new(0)).unwrap();
        assert!(barrier.check_stall().is_some());
        assert_eq!(barrier.check_stall(), None);
    }

    #[test]
    fn shrinking_the_peer_set_accepts_smaller_joint_actions() {
        let (mut barrier, _) = barrier();
        barrier.set_expected_peers([PeerId::from("p1")]);
        assert!(barrier.on_joint_action_ready(Frame::new(0), joint_action([("p1", 2u8)])));
    }
}
