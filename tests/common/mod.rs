//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic line-walk environment, a random policy and a recording
//!   render sink
//! - `relay`: an in-process relay that elects, announces, verifies and resyncs
//!
//! [`Cluster`] wires several sessions to one relay and drives them frame by frame:
//! ```ignore
//! mod common;
//! use common::Cluster;
//!
//! let mut cluster = Cluster::new(&["p1", "p2"], 42, 3, 1);
//! let outcomes = cluster.step_all(&[0, 1]);
//! ```

#![allow(dead_code)]

pub mod relay;
pub mod stubs;

use lockstep_sync::{
    LockstepEvent, LockstepSession, PeerId, SessionBuilder, StepOutcome, StepProgress,
};

use relay::{Relay, RelayLink};
use stubs::{Drift, LineConfig, LineState, LineWalk};

#[allow(unused_imports)]
pub use stubs::{FollowPolicy, RandomPolicy, RecordingSink};

/// Upper bound on poll rounds before a test gives up waiting for the peers.
pub const MAX_ROUNDS: usize = 32;

pub type LineSession = LockstepSession<LineConfig>;
pub type LineRelay = Relay<u8, LineState>;

/// Options for [`Cluster::with_options`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub seed: u64,
    pub horizon: u32,
    pub num_episodes: u32,
    pub verify_every_frame: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            horizon: 3,
            num_episodes: 1,
            verify_every_frame: true,
        }
    }
}

/// Several sessions sharing one in-process relay.
pub struct Cluster {
    pub relay: LineRelay,
    pub sessions: Vec<LineSession>,
    pub drifts: Vec<Drift>,
    pub sinks: Vec<RecordingSink>,
}

impl Cluster {
    pub fn new(peers: &[&str], seed: u64, horizon: u32, num_episodes: u32) -> Self {
        Self::with_options(
            peers,
            ClusterOptions {
                seed,
                horizon,
                num_episodes,
                ..ClusterOptions::default()
            },
        )
    }

    pub fn with_options(peers: &[&str], options: ClusterOptions) -> Self {
        let mut relay = Relay::new(options.seed);
        if !options.verify_every_frame {
            relay = relay.without_verification();
        }
        let mut sessions = Vec::new();
        let mut drifts = Vec::new();
        let mut sinks = Vec::new();
        for peer in peers {
            let link: RelayLink<u8, LineState> = relay.connect(*peer);
            let drift = Drift::new();
            let sink = RecordingSink::new();
            let env_drift = drift.clone();
            let agents: Vec<String> = peers.iter().map(|p| (*p).to_owned()).collect();
            let horizon = options.horizon;
            let session = SessionBuilder::<LineConfig>::new()
                .with_session_id("cluster")
                .with_local_peer(*peer)
                .with_expected_peers(peers.iter().copied())
                .with_num_episodes(options.num_episodes)
                .expect("valid episode count")
                .with_episode_metadata("line", "subject-1")
                .with_render_sink(sink.clone())
                .start_session(link, move || {
                    Ok(LineWalk::new(agents, horizon).with_drift(env_drift))
                })
                .expect("session starts");
            sessions.push(session);
            drifts.push(drift);
            sinks.push(sink);
        }
        relay.start();
        let mut cluster = Self {
            relay,
            sessions,
            drifts,
            sinks,
        };
        cluster.deliver();
        cluster
    }

    /// Lets the relay handle what the peers sent, then lets every peer handle the reply.
    pub fn pump(&mut self) {
        self.relay.pump();
        self.deliver();
    }

    /// Lets every peer handle what the relay sent.
    pub fn deliver(&mut self) {
        for session in &mut self.sessions {
            session.poll_remote_clients();
        }
    }

    /// Steps every peer exactly one frame, `actions[i]` being peer `i`'s action.
    ///
    /// # Panics
    ///
    /// If a peer errors, finishes, or does not advance within [`MAX_ROUNDS`].
    pub fn step_all(&mut self, actions: &[u8]) -> Vec<StepOutcome<Vec<i64>>> {
        assert_eq!(actions.len(), self.sessions.len(), "one action per peer");
        let mut outcomes: Vec<Option<StepOutcome<Vec<i64>>>> = vec![None; self.sessions.len()];
        for _ in 0..MAX_ROUNDS {
            for (i, session) in self.sessions.iter_mut().enumerate() {
                if outcomes[i].is_some() {
                    continue;
                }
                match session.step(actions[i]).expect("step failed") {
                    StepProgress::Stepped(outcome) => outcomes[i] = Some(outcome),
                    StepProgress::Done => panic!("{} is already done", session.local_peer()),
                    StepProgress::Paused | StepProgress::AwaitingJointAction { .. } => {},
                }
            }
            if outcomes.iter().all(Option::is_some) {
                return outcomes.into_iter().flatten().collect();
            }
            self.pump();
        }
        panic!("peers did not advance within {MAX_ROUNDS} rounds: {outcomes:?}");
    }

    /// Steps every peer `frames` times with the same action for everyone.
    pub fn run(&mut self, frames: usize, action: u8) {
        let actions = vec![action; self.sessions.len()];
        for _ in 0..frames {
            self.step_all(&actions);
        }
    }

    pub fn session(&self, peer: &str) -> &LineSession {
        self.sessions
            .iter()
            .find(|s| s.local_peer().as_str() == peer)
            .expect("unknown peer")
    }

    pub fn index_of(&self, peer: &str) -> usize {
        self.sessions
            .iter()
            .position(|s| s.local_peer().as_str() == peer)
            .expect("unknown peer")
    }

    /// Drains and returns the events of one peer.
    pub fn events(&mut self, peer: &str) -> Vec<LockstepEvent> {
        let index = self.index_of(peer);
        self.sessions[index].events().collect()
    }

    /// Disconnects a peer from the relay and drops its session.
    pub fn disconnect(&mut self, peer: &str) {
        let index = self.index_of(peer);
        self.sessions.remove(index);
        self.drifts.remove(index);
        self.sinks.remove(index);
        self.relay.disconnect(&PeerId::from(peer));
        self.deliver();
    }

    pub fn drift(&self, peer: &str) -> &Drift {
        &self.drifts[self.index_of(peer)]
    }
}

/// Installs a test subscriber so `tracing` output shows up with `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
