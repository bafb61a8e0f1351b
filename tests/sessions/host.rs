//! Host election, promotion and demotion.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::VecDeque;

use lockstep_sync::{
    Frame, HostCoordinator, InboundMessage, LockstepEvent, PeerId, ResyncState, Role,
    SessionState,
};
use proptest::prelude::*;

use crate::common::Cluster;

#[test]
fn first_peer_is_elected_host() {
    let cluster = Cluster::new(&["p1", "p2", "p3"], 42, 3, 1);
    assert!(cluster.session("p1").is_host());
    for peer in ["p2", "p3"] {
        assert_eq!(
            cluster.session(peer).role(),
            &Role::Peer {
                host: PeerId::from("p1")
            }
        );
        assert_eq!(cluster.session(peer).current_state(), SessionState::Ready);
    }
}

#[test]
fn host_leaving_promotes_the_next_peer_and_resyncs() {
    let mut cluster = Cluster::new(&["p1", "p2", "p3"], 7, 4, 1);
    cluster.run(2, 1);
    cluster.pump();
    let _ = cluster.events("p2");
    let _ = cluster.events("p3");

    cluster.disconnect("p1");
    assert!(cluster.session("p2").is_host());
    assert!(cluster
        .events("p2")
        .contains(&LockstepEvent::Promoted {
            frame: Frame::new(2)
        }));
    assert!(cluster.events("p3").contains(&LockstepEvent::HostChanged {
        new_host: PeerId::from("p2")
    }));
    assert_eq!(
        cluster.session("p3").expected_peers(),
        &[PeerId::from("p2"), PeerId::from("p3")]
    );
    assert_eq!(
        cluster.session("p2").resync_state(),
        ResyncState::Resyncing {
            frame: Frame::new(2)
        }
    );

    cluster.pump();
    assert!(cluster.session("p3").resync_state().is_active());

    cluster.run(2, 1);
    cluster.pump();
    assert_eq!(
        cluster.session("p2").digest().unwrap(),
        cluster.session("p3").digest().unwrap()
    );
    let flushes = cluster.relay.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].from, PeerId::from("p2"));
    assert_eq!(flushes[0].frames, vec![3, 4]);
    assert_eq!(cluster.session("p3").current_state(), SessionState::Done);
}

#[test]
fn last_peer_standing_carries_on_alone() {
    let mut cluster = Cluster::new(&["p1", "p2"], 7, 5, 1);
    cluster.run(1, 0);
    cluster.disconnect("p1");
    assert!(cluster.session("p2").is_host());
    cluster.run(4, 0);
    assert_eq!(cluster.session("p2").current_state(), SessionState::Done);
    cluster.pump();
    assert_eq!(cluster.relay.flushes().len(), 1);
    assert_eq!(cluster.relay.flushes()[0].frames, vec![2, 3, 4, 5]);
}

#[test]
fn demoted_host_drops_its_partial_episode() {
    let mut cluster = Cluster::new(&["p1", "p2"], 42, 3, 1);
    cluster.run(1, 1);
    assert_eq!(cluster.session("p1").buffered_records(), 1);

    let p1 = PeerId::from("p1");
    let p2 = PeerId::from("p2");
    cluster.relay.send_to(
        &p1,
        InboundMessage::HostChanged {
            new_host_id: p2.clone(),
        },
    );
    cluster.relay.send_to(
        &p2,
        InboundMessage::HostElected {
            is_host: true,
            host_id: Some(p2.clone()),
            seed: 42,
        },
    );
    cluster.deliver();

    assert!(cluster.events("p1").contains(&LockstepEvent::Demoted {
        new_host: p2.clone()
    }));
    assert_eq!(cluster.session("p1").buffered_records(), 0);
    assert!(cluster.session("p2").is_host());

    cluster.run(2, 1);
    cluster.pump();
    let flushes = cluster.relay.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].from, p2);
    assert_eq!(flushes[0].frames, vec![2, 3]);
}

#[derive(Debug, Clone)]
enum RoleMessage {
    Elected { is_host: bool, host: usize },
    Changed { host: usize },
}

fn peer(index: usize) -> PeerId {
    PeerId::from(format!("p{index}"))
}

fn deliver(coordinator: &mut HostCoordinator, message: &RoleMessage) {
    match message {
        RoleMessage::Elected { is_host, host } => {
            let _ = coordinator.on_elected(*is_host, Some(peer(*host)), 42);
        },
        RoleMessage::Changed { host } => {
            let _ = coordinator.on_host_changed(peer(*host));
        },
    }
}

/// Builds every peer's inbox for an initial election followed by `changes`.
fn inboxes(peers: usize, changes: &[(usize, bool)]) -> Vec<VecDeque<RoleMessage>> {
    let mut inboxes: Vec<VecDeque<RoleMessage>> = (0..peers)
        .map(|i| {
            VecDeque::from([RoleMessage::Elected {
                is_host: i == 0,
                host: 0,
            }])
        })
        .collect();
    for &(target, by_election) in changes {
        let target = target % peers;
        for (i, inbox) in inboxes.iter_mut().enumerate() {
            let message = if i == target && by_election {
                RoleMessage::Elected {
                    is_host: true,
                    host: target,
                }
            } else {
                RoleMessage::Changed { host: target }
            };
            inbox.push_back(message);
        }
    }
    inboxes
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn exactly_one_host_once_every_message_is_delivered(
        peers in 2usize..6,
        changes in prop::collection::vec((0usize..6, any::<bool>()), 0..8),
        schedule in prop::collection::vec(0usize..6, 0..64),
    ) {
        let mut coordinators: Vec<HostCoordinator> =
            (0..peers).map(|i| HostCoordinator::new(peer(i), None)).collect();
        let mut inboxes = inboxes(peers, &changes);

        // deliver in an arbitrary interleaving, each peer's own messages in order
        for pick in schedule {
            let index = pick % peers;
            if let Some(message) = inboxes[index].pop_front() {
                deliver(&mut coordinators[index], &message);
            }
        }
        for (coordinator, inbox) in coordinators.iter_mut().zip(inboxes.iter_mut()) {
            while let Some(message) = inbox.pop_front() {
                deliver(coordinator, &message);
            }
        }

        let expected_host = changes.last().map_or(0, |(target, _)| target % peers);
        let hosts: Vec<usize> = coordinators
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_host())
            .map(|(i, _)| i)
            .collect();
        prop_assert_eq!(hosts, vec![expected_host]);
        let expected_id = peer(expected_host);
        for coordinator in &coordinators {
            prop_assert_eq!(coordinator.host_id(), Some(&expected_id));
            prop_assert_eq!(coordinator.should_log(), coordinator.is_host());
            prop_assert_eq!(coordinator.seed(), Some(42));
        }
    }
}
