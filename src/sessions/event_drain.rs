//! Draining iterator over session events.

use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::LockstepEvent;

/// An opaque iterator that drains events from a [`LockstepSession`].
///
/// Wraps the session's internal queue drain so the public API does not expose
/// `std::collections::vec_deque::Drain`. Events come out oldest first.
///
/// ```ignore
/// for event in session.events() {
///     match event {
///         LockstepEvent::DivergenceDetected { frame } => warn!("diverged at {frame}"),
///         _ => {},
///     }
/// }
/// ```
///
/// [`LockstepSession`]: crate::LockstepSession
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: EventDrainInner<'a>,
}

enum EventDrainInner<'a> {
    Queue(Drain<'a, LockstepEvent>),
    Empty,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(drain: Drain<'a, LockstepEvent>) -> Self {
        Self {
            inner: EventDrainInner::Queue(drain),
        }
    }

    /// A drain that yields nothing.
    pub fn empty() -> Self {
        Self {
            inner: EventDrainInner::Empty,
        }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = LockstepEvent;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EventDrainInner::Queue(drain) => drain.next(),
            EventDrainInner::Empty => None,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            EventDrainInner::Queue(drain) => drain.size_hint(),
            EventDrainInner::Empty => (0, Some(0)),
        }
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EventDrainInner::Queue(drain) => drain.next_back(),
            EventDrainInner::Empty => None,
        }
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        match &self.inner {
            EventDrainInner::Queue(drain) => drain.len(),
            EventDrainInner::Empty => 0,
        }
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
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
    use std::collections::VecDeque;

    fn started(episode: u32) -> LockstepEvent {
        LockstepEvent::EpisodeStarted { episode }
    }

    #[test]
    fn empty_drain_yields_nothing() {
        let mut drain = EventDrain::empty();
        assert_eq!(drain.len(), 0);
        assert!(drain.next().is_none());
        assert!(drain.next_back().is_none());
    }

    #[test]
    fn drains_in_order_and_empties_queue() {
        let mut queue: VecDeque<LockstepEvent> = (0..3).map(started).collect();
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(events, vec![started(0), started(1), started(2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn double_ended_and_exact_size() {
        let mut queue: VecDeque<LockstepEvent> = (0..4).map(started).collect();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 4);
        assert_eq!(drain.next_back(), Some(started(3)));
        assert_eq!(drain.next(), Some(started(0)));
        assert_eq!(drain.len(), 2);
    }

    #[test]
    fn dropping_a_partial_drain_clears_the_rest() {
        let mut queue: VecDeque<LockstepEvent> = (0..5).map(started).collect();
        {
            let mut drain = EventDrain::from_drain(queue.drain(..));
            let _ = drain.next();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn debug_shows_remaining() {
        let mut queue: VecDeque<LockstepEvent> = (0..2).map(started).collect();
        let drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(format!("{drain:?}"), "EventDrain { remaining: 2 }");
    }
}
