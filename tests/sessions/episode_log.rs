#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use lockstep_sync::{LockstepEvent, PeerId};

use crate::common::{Cluster, ClusterOptions};

#[test]
fn only_the_host_flushes_each_episode_once() {
    let mut cluster = Cluster::new(&["p1", "p2", "p3"], 3, 3, 2);
    cluster.run(6, 2);
    cluster.pump();

    let flushes = cluster.relay.flushes();
    assert_eq!(flushes.len(), 2);
    for (episode, flush) in flushes.iter().enumerate() {
        assert_eq!(flush.from, PeerId::from("p1"));
        assert_eq!(flush.episode, episode as u32);
        assert_eq!(flush.frames, vec![1, 2, 3]);
        assert_eq!(flush.scene_id.as_deref(), Some("line"));
        assert_eq!(flush.subject_id.as_deref(), Some("subject-1"));
    }
    for peer in ["p2", "p3"] {
        assert_eq!(cluster.session(peer).buffered_records(), 0);
        assert!(!cluster
            .events(peer)
            .iter()
            .any(|e| matches!(e, LockstepEvent::EpisodeFlushed { .. })));
    }
}

#[test]
fn host_buffer_grows_until_the_episode_ends() {
    let mut cluster = Cluster::new(&["p1", "p2"], 3, 4, 1);
    for expected in 1..=3 {
        cluster.run(1, 0);
        assert_eq!(cluster.session("p1").buffered_records(), expected);
        assert_eq!(cluster.session("p2").buffered_records(), 0);
    }
    cluster.run(1, 0);
    assert_eq!(cluster.session("p1").buffered_records(), 0);
}

#[test]
fn flushes_do_not_depend_on_verification() {
    let mut cluster = Cluster::with_options(
        &["p1", "p2"],
        ClusterOptions {
            horizon: 2,
            num_episodes: 3,
            verify_every_frame: false,
            ..ClusterOptions::default()
        },
    );
    cluster.run(6, 1);
    cluster.pump();
    let episodes: Vec<u32> = cluster.relay.flushes().iter().map(|f| f.episode).collect();
    assert_eq!(episodes, vec![0, 1, 2]);
    assert!(cluster.relay.verified().is_empty());
}
