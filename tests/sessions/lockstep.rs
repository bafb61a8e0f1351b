//! Stepping, episodes and events for sessions driven by the in-process relay.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use lockstep_sync::{
    Frame, InboundMessage, LockstepError, LockstepEvent, PeerId, SessionBuilder, SessionState,
    StepProgress,
};

use crate::common::relay::Relay;
use crate::common::stubs::{LineConfig, LineState, LineWalk};
use crate::common::{init_tracing, Cluster, ClusterOptions, LineSession, RandomPolicy};

fn lone_session(relay: &mut Relay<u8, LineState>, env: LineWalk) -> LineSession {
    SessionBuilder::<LineConfig>::new()
        .with_session_id("solo")
        .with_local_peer("p1")
        .with_expected_peers(["p1"])
        .start_session(relay.connect("p1"), move || Ok(env))
        .expect("session starts")
}

#[test]
fn two_peers_agree_on_a_three_step_episode() {
    init_tracing();
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 3, 1);

    let mut frames = Vec::new();
    for actions in [[0, 1], [1, 1], [0, 0]] {
        let outcomes = cluster.step_all(&actions);
        assert_eq!(outcomes[0].frame, outcomes[1].frame);
        assert_eq!(outcomes[0].rewards, outcomes[1].rewards);
        assert_eq!(outcomes[0].render, outcomes[1].render);
        frames.push(outcomes[0].frame.as_i32());
        if frames.len() == 3 {
            assert!(outcomes.iter().all(|o| o.episode_complete));
        } else {
            assert!(outcomes.iter().all(|o| !o.episode_complete));
        }
    }
    assert_eq!(frames, vec![0, 1, 2]);

    let p1 = cluster.session("p1");
    let p2 = cluster.session("p2");
    assert_eq!(p1.cumulative_rewards(), p2.cumulative_rewards());
    assert_eq!(p1.digest().unwrap(), p2.digest().unwrap());
    assert_eq!(p1.current_state(), SessionState::Done);
    assert_eq!(p2.current_state(), SessionState::Done);

    // jitter adds at most one per step on top of the chosen actions
    let rewards = p1.cumulative_rewards();
    let p1_total = rewards[&PeerId::from("p1")];
    let p2_total = rewards[&PeerId::from("p2")];
    assert!((1.0..=4.0).contains(&p1_total), "p1 total {p1_total}");
    assert!((2.0..=5.0).contains(&p2_total), "p2 total {p2_total}");

    cluster.pump();
    let verified: Vec<i32> = cluster.relay.verified().iter().map(|f| f.as_i32()).collect();
    assert_eq!(verified, vec![1, 2, 3]);
    assert!(cluster.relay.divergences().is_empty());
}

#[test]
fn same_seed_same_actions_give_same_trajectory_across_clusters() {
    let mut first = Cluster::new(&["a", "b"], 9001, 5, 1);
    let mut second = Cluster::new(&["a", "b"], 9001, 5, 1);
    for actions in [[2, 0], [1, 1], [0, 2], [2, 2], [1, 0]] {
        let left = first.step_all(&actions);
        let right = second.step_all(&actions);
        assert_eq!(left, right);
        assert_eq!(
            first.session("a").digest().unwrap(),
            second.session("a").digest().unwrap()
        );
    }
}

#[test]
fn different_seeds_diverge() {
    let mut first = Cluster::new(&["a", "b"], 1, 8, 1);
    let mut second = Cluster::new(&["a", "b"], 2, 8, 1);
    first.run(4, 1);
    second.run(4, 1);
    assert_ne!(
        first.session("a").digest().unwrap(),
        second.session("a").digest().unwrap()
    );
}

#[test]
fn step_before_election_is_not_elected() {
    let mut relay: Relay<u8, LineState> = Relay::new(42);
    let mut session = lone_session(&mut relay, LineWalk::new(["p1"], 3));
    assert_eq!(session.current_state(), SessionState::Initializing);
    assert_eq!(session.step(0), Err(LockstepError::NotElected));
    assert_eq!(session.events().count(), 0);
}

#[test]
fn step_waits_for_the_joint_action() {
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 3, 1);
    let first = cluster.sessions[0].step(1).unwrap();
    assert_eq!(
        first,
        StepProgress::AwaitingJointAction {
            frame: Frame::new(0)
        }
    );
    // the second call must not resubmit or overwrite the first action
    let again = cluster.sessions[0].step(2).unwrap();
    assert_eq!(
        again,
        StepProgress::AwaitingJointAction {
            frame: Frame::new(0)
        }
    );
    cluster.pump();
    assert_eq!(cluster.session("p1").frame(), Frame::new(0));

    let outcomes = cluster.step_all(&[2, 0]);
    let p1_moved = outcomes[0].rewards[&PeerId::from("p1")];
    // the first submitted action (1) was executed, plus a jitter of 0 or 1
    assert!((1.0..=2.0).contains(&p1_moved), "p1 moved {p1_moved}");
}

#[test]
fn session_moves_through_its_states() {
    let mut relay: Relay<u8, LineState> = Relay::new(5);
    let mut session = lone_session(&mut relay, LineWalk::new(["p1"], 2));
    assert_eq!(session.current_state(), SessionState::Initializing);

    relay.start();
    session.poll_remote_clients();
    assert_eq!(session.current_state(), SessionState::Ready);
    assert!(session.is_host());
    assert!(session.is_game_ready());

    assert!(matches!(
        session.step(0).unwrap(),
        StepProgress::AwaitingJointAction { .. }
    ));
    assert_eq!(session.current_state(), SessionState::Running);

    relay.pump();
    session.poll_remote_clients();
    assert!(matches!(session.step(0).unwrap(), StepProgress::Stepped(_)));

    let mut progress = session.step(0).unwrap();
    for _ in 0..4 {
        if matches!(progress, StepProgress::Stepped(_)) {
            break;
        }
        relay.pump();
        session.poll_remote_clients();
        progress = session.step(0).unwrap();
    }
    assert!(matches!(progress, StepProgress::Stepped(ref o) if o.episode_complete));
    assert_eq!(session.current_state(), SessionState::Done);
    assert_eq!(session.step(0), Ok(StepProgress::Done));
}

#[test]
fn events_follow_the_episode_lifecycle() {
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 2, 2);
    cluster.run(4, 1);

    let events = cluster.events("p1");
    assert!(matches!(
        events.first(),
        Some(LockstepEvent::HostElected { is_host: true, seed: 42, .. })
    ));
    let lifecycle: Vec<&LockstepEvent> = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                LockstepEvent::EpisodeStarted { .. }
                    | LockstepEvent::EpisodeCompleted { .. }
                    | LockstepEvent::EpisodeFlushed { .. }
                    | LockstepEvent::SessionDone
            )
        })
        .collect();
    assert_eq!(lifecycle.len(), 7, "{lifecycle:?}");
    assert_eq!(lifecycle[0], &LockstepEvent::EpisodeStarted { episode: 0 });
    assert!(matches!(lifecycle[1], LockstepEvent::EpisodeCompleted { episode: 0, .. }));
    assert_eq!(
        lifecycle[2],
        &LockstepEvent::EpisodeFlushed {
            episode: 0,
            records: 2
        }
    );
    assert_eq!(lifecycle[3], &LockstepEvent::EpisodeStarted { episode: 1 });
    assert!(matches!(lifecycle[4], LockstepEvent::EpisodeCompleted { episode: 1, .. }));
    assert!(matches!(lifecycle[5], LockstepEvent::EpisodeFlushed { episode: 1, .. }));
    assert_eq!(lifecycle[6], &LockstepEvent::SessionDone);

    let digests = events
        .iter()
        .filter(|e| matches!(e, LockstepEvent::DigestSubmitted { .. }))
        .count();
    assert_eq!(digests, 4);

    let p2_events = cluster.events("p2");
    assert!(matches!(
        p2_events.first(),
        Some(LockstepEvent::HostElected { is_host: false, .. })
    ));
    assert!(!p2_events
        .iter()
        .any(|e| matches!(e, LockstepEvent::EpisodeFlushed { .. })));
}

#[test]
fn frames_restart_every_episode() {
    let mut cluster = Cluster::new(&["p1", "p2"], 3, 3, 2);
    let mut frames = Vec::new();
    for _ in 0..6 {
        let outcomes = cluster.step_all(&[1, 0]);
        frames.push(outcomes[0].frame.as_i32());
    }
    assert_eq!(frames, vec![0, 1, 2, 0, 1, 2]);
    assert_eq!(cluster.session("p2").episode(), 2);
}

#[test]
fn environment_failure_is_terminal() {
    let mut relay: Relay<u8, LineState> = Relay::new(5);
    let mut session = lone_session(&mut relay, LineWalk::new(["p1"], 10).failing_at(1));
    relay.start();
    session.poll_remote_clients();

    let mut stepped = 0;
    let err = loop {
        match session.step(0) {
            Ok(StepProgress::Stepped(_)) => stepped += 1,
            Ok(_) => {},
            Err(err) => break err,
        }
        relay.pump();
        session.poll_remote_clients();
    };
    assert_eq!(stepped, 1);
    assert!(matches!(err, LockstepError::Environment { .. }));
    assert_eq!(session.current_state(), SessionState::Failed);
    assert_eq!(session.step(0), Err(err));
}

#[test]
fn policy_evaluation_keeps_peers_in_sync() {
    let mut cluster = Cluster::new(&["p1", "p2"], 77, 6, 1);
    cluster.step_all(&[0, 0]);
    for _ in 0..4 {
        let mut actions = Vec::new();
        for session in &mut cluster.sessions {
            let me = session.local_peer().clone();
            let mut policy = RandomPolicy;
            // both peers evaluate both agents so the policy streams stay aligned
            let a = session.evaluate_policy(&mut policy, &PeerId::from("p1"));
            let b = session.evaluate_policy(&mut policy, &PeerId::from("p2"));
            let mine = if me.as_str() == "p1" { a } else { b };
            actions.push(mine.expect("agent has an observation"));
        }
        cluster.step_all(&actions);
    }
    assert_eq!(
        cluster.session("p1").digest().unwrap(),
        cluster.session("p2").digest().unwrap()
    );
    cluster.pump();
    assert!(cluster.relay.divergences().is_empty());

    let mut policy = RandomPolicy;
    assert_eq!(
        cluster.sessions[0].evaluate_policy(&mut policy, &PeerId::from("nobody")),
        None
    );
}

#[test]
fn render_sink_sees_reset_and_every_step() {
    let mut cluster = Cluster::with_options(
        &["p1", "p2"],
        ClusterOptions {
            horizon: 4,
            ..ClusterOptions::default()
        },
    );
    cluster.run(4, 1);
    for sink in &cluster.sinks {
        let steps: Vec<u32> = sink.frames().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![0, 1, 2, 3, 4]);
    }
    assert_eq!(cluster.sinks[0].frames(), cluster.sinks[1].frames());
}

#[test]
fn stalled_joint_action_is_reported_once() {
    let mut relay: Relay<u8, LineState> = Relay::new(1);
    let mut session = SessionBuilder::<LineConfig>::new()
        .with_local_peer("p1")
        .with_expected_peers(["p1", "p2"])
        .with_stall_warning_after(Duration::from_millis(1))
        .start_session(relay.connect("p1"), || Ok(LineWalk::new(["p1", "p2"], 3)))
        .unwrap();
    let _silent = relay.connect("p2");
    relay.start();
    session.poll_remote_clients();
    assert!(matches!(
        session.step(0).unwrap(),
        StepProgress::AwaitingJointAction { .. }
    ));

    std::thread::sleep(Duration::from_millis(10));
    relay.pump();
    session.poll_remote_clients();
    session.poll_remote_clients();

    let stalls: Vec<LockstepEvent> = session
        .events()
        .filter(|e| matches!(e, LockstepEvent::JointActionStalled { .. }))
        .collect();
    assert_eq!(stalls.len(), 1);
    match &stalls[0] {
        LockstepEvent::JointActionStalled { frame, waited_ms } => {
            assert_eq!(*frame, Frame::new(0));
            assert!(*waited_ms >= 1);
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn event_queue_keeps_only_the_newest_events() {
    let mut relay: Relay<u8, LineState> = Relay::new(1);
    let mut session = SessionBuilder::<LineConfig>::new()
        .with_local_peer("p1")
        .with_expected_peers(["p1"])
        .with_event_queue_size(10)
        .unwrap()
        .start_session(relay.connect("p1"), || Ok(LineWalk::new(["p1"], 100)))
        .unwrap();
    relay.start();
    session.poll_remote_clients();
    for _ in 0..40 {
        let _ = session.step(0).unwrap();
        relay.pump();
        session.poll_remote_clients();
    }
    let events: Vec<LockstepEvent> = session.events().collect();
    assert_eq!(events.len(), 10);
    assert!(!events
        .iter()
        .any(|e| matches!(e, LockstepEvent::HostElected { .. })));
}

#[test]
fn joint_action_missing_a_peer_is_not_executed() {
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 3, 1);
    let _ = cluster.sessions[0].step(1).unwrap();
    let mut joint = std::collections::BTreeMap::new();
    joint.insert(PeerId::from("p1"), 1u8);
    cluster.relay.send_to(
        &PeerId::from("p1"),
        InboundMessage::JointActionReady {
            frame: Frame::new(0),
            joint_action: joint,
        },
    );
    cluster.deliver();
    assert!(matches!(
        cluster.sessions[0].step(1).unwrap(),
        StepProgress::AwaitingJointAction { .. }
    ));
    assert_eq!(cluster.session("p1").frame(), Frame::new(0));
}
