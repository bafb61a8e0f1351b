//! Host-only episode data logging.
//!
//! Only the host records frames, and it flushes them to the relay exactly once per
//! completed episode. Non-hosts never accumulate anything, so at most one copy of each
//! episode's data ever reaches the relay.

use std::sync::Arc;

use tracing::{debug, info};

use crate::frame_info::FrameRecord;
use crate::network::messages::OutboundMessage;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{PeerId, SessionId};

/// Accumulates [`FrameRecord`]s on the host and flushes them per episode.
pub struct EpisodeDataLogger<A> {
    session_id: SessionId,
    local: PeerId,
    scene_id: Option<String>,
    subject_id: Option<String>,
    buffer: Vec<FrameRecord<A>>,
    last_flushed: Option<u32>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<A> std::fmt::Debug for EpisodeDataLogger<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeDataLogger")
            .field("local", &self.local)
            .field("scene_id", &self.scene_id)
            .field("subject_id", &self.subject_id)
            .field("buffered", &self.buffer.len())
            .field("last_flushed", &self.last_flushed)
            .finish_non_exhaustive()
    }
}

impl<A> EpisodeDataLogger<A> {
    /// Creates an empty logger.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        local: PeerId,
        scene_id: Option<String>,
        subject_id: Option<String>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            session_id,
            local,
            scene_id,
            subject_id,
            buffer: Vec::new(),
            last_flushed: None,
            violation_observer,
        }
    }

    /// Appends a record if the local peer should log.
    pub fn record(&mut self, should_log: bool, record: FrameRecord<A>) {
        if should_log {
            self.buffer.push(record);
        }
    }

    /// Builds the flush for a completed `episode` and empties the buffer.
    ///
    /// Returns `None` for non-hosts, whose buffer is dropped, and for an episode that was
    /// already flushed, which is reported.
    pub fn flush<S>(&mut self, should_log: bool, episode: u32) -> Option<OutboundMessage<A, S>> {
        if !should_log {
            self.discard();
            return None;
        }
        if self.last_flushed.is_some_and(|last| episode <= last) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::EpisodeLog,
                "episode {} flushed twice (last flushed {:?})",
                episode,
                self.last_flushed
            );
            self.discard();
            return None;
        }
        self.last_flushed = Some(episode);
        let buffer = std::mem::take(&mut self.buffer);
        info!(episode, records = buffer.len(), "flushing episode data");
        Some(OutboundMessage::FlushEpisodeData {
            session_id: self.session_id.clone(),
            peer_id: self.local.clone(),
            episode,
            scene_id: self.scene_id.clone(),
            subject_id: self.subject_id.clone(),
            buffer,
        })
    }

    /// Drops the buffered records without sending them.
    pub fn discard(&mut self) {
        if !self.buffer.is_empty() {
            debug!(dropped = self.buffer.len(), "discarding episode buffer");
        }
        self.buffer.clear();
    }

    /// The records buffered so far.
    #[must_use]
    pub fn records(&self) -> &[FrameRecord<A>] {
        &self.buffer
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
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
    use std::collections::BTreeMap;

    use super::*;
    use crate::frame_info::Info;
    use crate::network::messages::joint_action;
    use crate::observation::Observations;
    use crate::telemetry::CollectingObserver;
    use crate::Frame;

    type Outbound = Option<OutboundMessage<u8, ()>>;

    fn record(frame: i32) -> FrameRecord<u8> {
        FrameRecord {
            frame: Frame::new(frame),
            observations: Observations::new(),
            actions: joint_action([("p1", 0u8), ("p2", 1u8)]),
            rewards: BTreeMap::new(),
            terminated: BTreeMap::new(),
            truncated: BTreeMap::new(),
            info: Info::new(),
        }
    }

    fn logger() -> (EpisodeDataLogger<u8>, Arc<CollectingObserver>) {
        let observer = Arc::new(CollectingObserver::new());
        let logger = EpisodeDataLogger::new(
            SessionId::from("s"),
            PeerId::from("p1"),
            Some("maze".to_owned()),
            None,
            Some(observer.clone()),
        );
        (logger, observer)
    }

    #[test]
    fn host_flushes_everything_once() {
        let (mut log, observer) = logger();
        for f in 0..3 {
            log.record(true, record(f));
        }
        let msg: Outbound = log.flush(true, 0);
        match msg {
            Some(OutboundMessage::FlushEpisodeData {
                episode,
                scene_id,
                subject_id,
                buffer,
                ..
            }) => {
                assert_eq!(episode, 0);
                assert_eq!(scene_id.as_deref(), Some("maze"));
                assert_eq!(subject_id, None);
                let frames: Vec<i32> = buffer.iter().map(|r| r.frame.as_i32()).collect();
                assert_eq!(frames, vec![0, 1, 2]);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(log.is_empty());

        let again: Outbound = log.flush(true, 0);
        assert!(again.is_none());
        assert!(observer.has_violation(ViolationKind::EpisodeLog));
    }

    #[test]
    fn non_host_never_accumulates() {
        let (mut log, _) = logger();
        log.record(false, record(0));
        assert!(log.is_empty());
        let msg: Outbound = log.flush(false, 0);
        assert!(msg.is_none());
    }

    #[test]
    fn later_episodes_flush_independently() {
        let (mut log, _) = logger();
        log.record(true, record(0));
        let first: Outbound = log.flush(true, 0);
        log.record(true, record(0));
        log.record(true, record(1));
        let second: Outbound = log.flush(true, 1);
        assert!(first.is_some());
        match second {
            Some(OutboundMessage::FlushEpisodeData { buffer, .. }) => assert_eq!(buffer.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn discard_drops_partial_episode() {
        let (mut log, _) = logger();
        log.record(true, record(0));
        log.discard();
        assert_eq!(log.len(), 0);
        assert!(log.records().is_empty());
    }
}
