//! Divergence detection, snapshot serving and snapshot application.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use lockstep_sync::telemetry::{CollectingObserver, ViolationKind};
use lockstep_sync::{
    Frame, InboundMessage, LockstepEvent, PeerId, ResyncState, SessionBuilder, SessionState,
    StepProgress,
};

use crate::common::relay::Relay;
use crate::common::stubs::{LineConfig, LineState, LineWalk};
use crate::common::{init_tracing, Cluster, FollowPolicy};

fn has_event(events: &[LockstepEvent], wanted: &LockstepEvent) -> bool {
    events.iter().any(|e| e == wanted)
}

#[test]
fn divergence_at_frame_ten_is_repaired_from_the_host() {
    init_tracing();
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 50, 1);
    cluster.run(9, 1);
    assert_eq!(cluster.session("p2").frame(), Frame::new(9));

    cluster.drift("p2").inject(5);
    let outcomes = cluster.step_all(&[1, 1]);
    assert_eq!(outcomes[0].frame, Frame::new(9));
    assert_ne!(outcomes[0].rewards, outcomes[1].rewards);
    assert_ne!(
        cluster.session("p1").digest().unwrap(),
        cluster.session("p2").digest().unwrap()
    );

    // the relay compares the frame 10 digests and reports the mismatch
    cluster.pump();
    assert_eq!(cluster.relay.divergences(), &[Frame::new(10)]);
    let divergence = LockstepEvent::DivergenceDetected {
        frame: Frame::new(10),
    };
    let host_events = cluster.events("p1");
    assert!(has_event(&host_events, &divergence));
    assert!(has_event(
        &host_events,
        &LockstepEvent::SnapshotServed {
            frame: Frame::new(10)
        }
    ));
    assert!(has_event(&cluster.events("p2"), &divergence));
    assert_eq!(
        cluster.session("p1").resync_state(),
        ResyncState::Resyncing {
            frame: Frame::new(10)
        }
    );
    assert_eq!(
        cluster.session("p2").resync_state(),
        ResyncState::Paused {
            frame: Frame::new(10)
        }
    );
    assert_eq!(cluster.session("p2").current_state(), SessionState::Paused);
    assert_eq!(cluster.sessions[1].step(1), Ok(StepProgress::Paused));

    // the relay forwards the host's snapshot
    cluster.pump();
    assert_eq!(cluster.relay.snapshots_forwarded(), 1);
    assert!(has_event(
        &cluster.events("p2"),
        &LockstepEvent::SnapshotApplied {
            frame: Frame::new(10)
        }
    ));
    assert!(cluster.session("p2").resync_state().is_active());
    assert_eq!(cluster.session("p2").frame(), Frame::new(10));
    assert_eq!(
        cluster.session("p1").digest().unwrap(),
        cluster.session("p2").digest().unwrap()
    );
    assert_eq!(
        cluster.session("p1").cumulative_rewards(),
        cluster.session("p2").cumulative_rewards()
    );
    assert_eq!(cluster.sinks[1].last_step(), Some(10));

    // both resume from frame 10 and agree at frame 11
    let outcomes = cluster.step_all(&[0, 2]);
    assert_eq!(outcomes[0].frame, Frame::new(10));
    assert_eq!(outcomes[1].frame, Frame::new(10));
    assert_eq!(outcomes[0].rewards, outcomes[1].rewards);
    assert_eq!(
        cluster.session("p1").digest().unwrap(),
        cluster.session("p2").digest().unwrap()
    );
    cluster.pump();
    assert!(cluster.relay.verified().contains(&Frame::new(11)));
    assert_eq!(cluster.relay.divergences().len(), 1);
    assert!(cluster.session("p1").resync_state().is_active());
}

#[test]
fn repaired_peer_feeds_policies_the_host_observations() {
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 50, 1);
    cluster.run(4, 1);
    cluster.drift("p2").inject(7);
    cluster.step_all(&[1, 1]);
    assert_ne!(
        cluster.session("p1").runner().observations(),
        cluster.session("p2").runner().observations()
    );

    cluster.pump();
    cluster.pump();
    assert_eq!(cluster.relay.snapshots_forwarded(), 1);
    assert!(cluster.session("p2").resync_state().is_active());
    assert_eq!(
        cluster.session("p1").runner().observations(),
        cluster.session("p2").runner().observations()
    );

    let p1 = PeerId::from("p1");
    let host_action = cluster.sessions[0].evaluate_policy(&mut FollowPolicy, &p1);
    let peer_action = cluster.sessions[1].evaluate_policy(&mut FollowPolicy, &p1);
    assert!(host_action.is_some());
    assert_eq!(host_action, peer_action);
    assert_eq!(
        cluster.session("p1").digest().unwrap(),
        cluster.session("p2").digest().unwrap()
    );
}

#[test]
fn replay_after_snapshot_tracks_the_host() {
    let mut cluster = Cluster::new(&["p1", "p2", "p3"], 11, 40, 1);
    cluster.run(4, 2);
    cluster.drift("p3").inject(-3);
    cluster.run(1, 2);
    cluster.pump();
    cluster.pump();

    for actions in [[0, 1, 2], [2, 2, 2], [1, 0, 1], [0, 0, 0]] {
        cluster.step_all(&actions);
        let host = cluster.session("p1").digest().unwrap();
        for peer in ["p2", "p3"] {
            assert_eq!(cluster.session(peer).digest().unwrap(), host, "{peer}");
        }
    }
    cluster.pump();
    assert_eq!(cluster.relay.divergences(), &[Frame::new(5)]);
    // the untouched peer applies the snapshot too
    assert_eq!(cluster.relay.snapshots_forwarded(), 2);
}

#[test]
fn nothing_advances_while_paused() {
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 20, 1);
    cluster.run(2, 1);
    cluster.relay.send_to(
        &PeerId::from("p2"),
        InboundMessage::DivergenceDetected {
            frame: Frame::new(2),
        },
    );
    cluster.deliver();

    for _ in 0..3 {
        assert_eq!(cluster.sessions[1].step(1), Ok(StepProgress::Paused));
        cluster.pump();
    }
    assert_eq!(cluster.session("p2").frame(), Frame::new(2));
    assert_eq!(cluster.session("p2").current_state(), SessionState::Paused);

    // announcements that arrive while paused are dropped, not executed later
    let mut joint = std::collections::BTreeMap::new();
    joint.insert(PeerId::from("p1"), 1u8);
    joint.insert(PeerId::from("p2"), 1u8);
    cluster.relay.send_to(
        &PeerId::from("p2"),
        InboundMessage::JointActionReady {
            frame: Frame::new(2),
            joint_action: joint,
        },
    );
    cluster.deliver();
    assert_eq!(cluster.sessions[1].step(1), Ok(StepProgress::Paused));
    assert_eq!(cluster.session("p2").frame(), Frame::new(2));
}

#[test]
fn tampered_snapshot_is_rejected_and_peer_stays_paused() {
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 20, 1);
    cluster.run(3, 1);
    let before = cluster.session("p2").digest().unwrap();

    let mut snapshot = cluster.session("p1").runner().snapshot().unwrap();
    snapshot.step += 1;
    let p2 = PeerId::from("p2");
    cluster.relay.send_to(
        &p2,
        InboundMessage::DivergenceDetected {
            frame: Frame::new(3),
        },
    );
    cluster.relay.send_to(&p2, InboundMessage::ApplySnapshot { snapshot });
    cluster.deliver();

    let events = cluster.events("p2");
    assert!(events.iter().any(|e| matches!(
        e,
        LockstepEvent::ResyncFailed { frame, .. } if *frame == Frame::new(3)
    )));
    assert_eq!(cluster.session("p2").current_state(), SessionState::Paused);
    assert_eq!(cluster.session("p2").digest().unwrap(), before);

    // a genuine snapshot still brings the peer back
    let snapshot = cluster.session("p1").runner().snapshot().unwrap();
    cluster
        .relay
        .send_to(&p2, InboundMessage::ApplySnapshot { snapshot });
    cluster.deliver();
    assert_eq!(cluster.session("p2").current_state(), SessionState::Running);
}

#[test]
fn snapshot_request_to_a_non_host_is_reported() {
    let observer = Arc::new(CollectingObserver::new());
    let mut relay: Relay<u8, LineState> = Relay::new(3);
    let _host = relay.connect("p1");
    let mut session = SessionBuilder::<LineConfig>::new()
        .with_local_peer("p2")
        .with_expected_peers(["p1", "p2"])
        .with_violation_observer(observer.clone())
        .start_session(relay.connect("p2"), || Ok(LineWalk::new(["p1", "p2"], 5)))
        .unwrap();
    relay.start();
    session.poll_remote_clients();
    assert!(!session.is_host());

    relay.send_to(
        &PeerId::from("p2"),
        InboundMessage::RequestSnapshot {
            frame: Frame::new(0),
        },
    );
    session.poll_remote_clients();
    assert!(observer.has_violation(ViolationKind::Snapshot));
    assert!(session.resync_state().is_active());
    assert!(!session
        .events()
        .any(|e| matches!(e, LockstepEvent::SnapshotServed { .. })));
}

#[test]
fn host_ignores_snapshots_sent_to_it() {
    let observer = Arc::new(CollectingObserver::new());
    let mut relay: Relay<u8, LineState> = Relay::new(3);
    let mut session = SessionBuilder::<LineConfig>::new()
        .with_local_peer("p1")
        .with_expected_peers(["p1"])
        .with_violation_observer(observer.clone())
        .start_session(relay.connect("p1"), || Ok(LineWalk::new(["p1"], 5)))
        .unwrap();
    relay.start();
    session.poll_remote_clients();
    let _ = session.step(0).unwrap();

    let snapshot = session.runner().snapshot().unwrap();
    relay.send_to(&PeerId::from("p1"), InboundMessage::ApplySnapshot { snapshot });
    session.poll_remote_clients();
    assert!(observer.has_violation(ViolationKind::Snapshot));
    assert_eq!(session.current_state(), SessionState::Running);
}

#[test]
fn host_resumes_when_the_game_is_announced_again() {
    let mut cluster = Cluster::new(&["p1", "p2"], 8, 20, 1);
    cluster.run(2, 0);
    let p1 = PeerId::from("p1");
    cluster.relay.send_to(
        &p1,
        InboundMessage::RequestSnapshot {
            frame: Frame::new(2),
        },
    );
    cluster.deliver();
    assert_eq!(
        cluster.session("p1").current_state(),
        SessionState::Resyncing
    );
    cluster.relay.send_to(
        &p1,
        InboundMessage::GameReady {
            peers: vec![p1.clone(), PeerId::from("p2")],
        },
    );
    cluster.deliver();
    assert_eq!(cluster.session("p1").current_state(), SessionState::Running);
}
