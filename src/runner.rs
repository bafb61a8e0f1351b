//! The deterministic environment runner.
//!
//! Owns one [`Environment`] together with the two seeded generators and the episode
//! bookkeeping. For a fixed seed the runner is a pure function of the joint actions it is
//! fed: the same sequence produces the same observations, rewards and digests on every
//! peer.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{debug, info, trace};

use crate::checksum::StateDigest;
use crate::frame_info::{DigestProjection, FullSnapshot, Rendered, ResetOutcome, StepOutcome};
use crate::observation::{episode_complete, normalise_observation, Observations};
use crate::rng::Pcg32;
use crate::{Config, Environment, Frame, JointAction, LockstepError, PeerId, Policy};

/// Steps an [`Environment`] in lockstep and tracks everything a digest covers.
pub struct DeterministicEnvironmentRunner<T: Config> {
    env: Box<dyn Environment<T>>,
    seed: Option<u64>,
    env_rng: Pcg32,
    policy_rng: Pcg32,
    episode: u32,
    step: u32,
    frame: Frame,
    num_episodes: u32,
    cumulative_rewards: BTreeMap<PeerId, f64>,
    expected: SmallVec<[PeerId; 4]>,
    observations: Observations,
    needs_reset: bool,
    done: bool,
}

impl<T: Config> std::fmt::Debug for DeterministicEnvironmentRunner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicEnvironmentRunner")
            .field("seed", &self.seed)
            .field("episode", &self.episode)
            .field("step", &self.step)
            .field("frame", &self.frame)
            .field("num_episodes", &self.num_episodes)
            .field("cumulative_rewards", &self.cumulative_rewards)
            .field("expected", &self.expected)
            .field("needs_reset", &self.needs_reset)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<T: Config> DeterministicEnvironmentRunner<T> {
    /// Wraps an environment. Nothing is seeded until [`reset`](Self::reset).
    pub fn new(
        env: Box<dyn Environment<T>>,
        expected: impl IntoIterator<Item = PeerId>,
        num_episodes: u32,
    ) -> Self {
        Self {
            env,
            seed: None,
            env_rng: Pcg32::with_stream(0, Pcg32::ENVIRONMENT_STREAM),
            policy_rng: Pcg32::with_stream(0, Pcg32::POLICY_STREAM),
            episode: 0,
            step: 0,
            frame: Frame::new(0),
            num_episodes,
            cumulative_rewards: BTreeMap::new(),
            expected: expected.into_iter().collect(),
            observations: Observations::new(),
            needs_reset: true,
            done: false,
        }
    }

    /// Starts the current episode.
    ///
    /// Both generators are re-seeded from `seed`, frame and step go back to 0 and the
    /// cumulative reward of every agent in the initial observation is zeroed. If the
    /// environment fails, the runner is left as it was.
    ///
    /// # Errors
    ///
    /// [`LockstepError::SessionDone`] once every configured episode has completed, or
    /// [`LockstepError::Environment`] if the environment fails to reset.
    pub fn reset(&mut self, seed: u64) -> Result<ResetOutcome<T::Render>, LockstepError> {
        if self.done {
            return Err(LockstepError::SessionDone);
        }
        let mut env_rng = Pcg32::with_stream(seed, Pcg32::ENVIRONMENT_STREAM);
        let policy_rng = Pcg32::with_stream(seed, Pcg32::POLICY_STREAM);
        let reset = self.env.reset(seed, &mut env_rng)?;
        let observations = normalise_observation(reset.observation);

        self.seed = Some(seed);
        self.env_rng = env_rng;
        self.policy_rng = policy_rng;
        self.frame = Frame::new(0);
        self.step = 0;
        self.cumulative_rewards = observations.keys().map(|agent| (agent.clone(), 0.0)).collect();
        self.observations = observations;
        self.needs_reset = false;
        info!(episode = self.episode, seed, "episode reset");

        Ok(ResetOutcome {
            observations: self.observations.clone(),
            info: reset.info,
            render: self.rendered(),
        })
    }

    /// Executes one joint action.
    ///
    /// # Errors
    ///
    /// - [`LockstepError::IncompleteJointAction`] if an expected peer has no entry. The
    ///   runner is left untouched.
    /// - [`LockstepError::SessionDone`] once every episode has completed.
    /// - [`LockstepError::Environment`] if the runner needs a reset or the environment
    ///   fails to step.
    pub fn step(
        &mut self,
        joint_action: &JointAction<T::Action>,
    ) -> Result<StepOutcome<T::Render>, LockstepError> {
        if self.done {
            return Err(LockstepError::SessionDone);
        }
        if self.needs_reset {
            return Err(LockstepError::Environment {
                context: format!("episode {} has not been reset", self.episode),
            });
        }
        let missing: Vec<PeerId> = self
            .expected
            .iter()
            .filter(|peer| !joint_action.contains_key(*peer))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(LockstepError::IncompleteJointAction {
                frame: self.frame,
                missing,
            });
        }

        let result = self.env.step(joint_action, &mut self.env_rng)?;
        let observations = normalise_observation(result.observation);
        let rewards = result.rewards.normalise();
        let terminated = result.terminated.normalise();
        let truncated = result.truncated.normalise();
        for (agent, reward) in &rewards {
            *self.cumulative_rewards.entry(agent.clone()).or_insert(0.0) += reward;
        }

        let executed = self.frame;
        self.frame += 1;
        self.step += 1;
        self.observations = observations;
        let complete = episode_complete(&terminated, &truncated);
        if complete {
            self.needs_reset = true;
        }
        trace!(frame = %executed, complete, "stepped");

        Ok(StepOutcome {
            frame: executed,
            observations: self.observations.clone(),
            rewards,
            terminated,
            truncated,
            info: result.info,
            render: self.rendered(),
            episode_complete: complete,
        })
    }

    /// Closes the current episode.
    ///
    /// Returns `true` if another episode follows and needs a reset, `false` once the
    /// configured number of episodes has been played.
    pub fn complete_episode(&mut self) -> bool {
        info!(episode = self.episode, rewards = ?self.cumulative_rewards, "episode completed");
        self.episode += 1;
        self.needs_reset = true;
        if self.episode >= self.num_episodes {
            self.done = true;
        }
        !self.done
    }

    /// The canonical digest input for the current state.
    #[must_use]
    pub fn digest_projection(&self) -> DigestProjection {
        DigestProjection {
            episode: self.episode,
            step: self.step,
            frame: self.frame,
            cumulative_rewards: self.cumulative_rewards.clone(),
            env_rng: self.env_rng.clone(),
            policy_rng: self.policy_rng.clone(),
        }
    }

    /// Digest of the current state.
    ///
    /// # Errors
    ///
    /// [`LockstepError::Serialization`] if the projection cannot be encoded.
    pub fn digest(&self) -> Result<StateDigest, LockstepError> {
        Ok(self.digest_projection().digest()?)
    }

    /// Captures and seals the full state.
    ///
    /// # Errors
    ///
    /// Fails if the environment cannot save its state or the snapshot cannot be sealed.
    pub fn snapshot(&self) -> Result<FullSnapshot<T::EnvState>, LockstepError> {
        let env_state = self.env.save_state()?;
        Ok(FullSnapshot::seal(
            self.digest_projection(),
            self.observations.clone(),
            env_state,
        )?)
    }

    /// Restores a snapshot taken by another peer's runner.
    ///
    /// Everything is validated before anything changes: the seal, the frame, the episode
    /// and the agent set. Observations are restored with the rest so policies read the
    /// host's latest observation. The environment restores its own state last and must leave
    /// itself unchanged when it fails, so a rejected snapshot leaves the runner as it was.
    ///
    /// # Errors
    ///
    /// [`LockstepError::SnapshotRejected`] describing the first failed check.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &FullSnapshot<T::EnvState>,
    ) -> Result<(), LockstepError> {
        let rejected = |reason: String| LockstepError::SnapshotRejected { reason };

        match snapshot.verify() {
            Ok(true) => {},
            Ok(false) => return Err(rejected("seal does not match contents".to_owned())),
            Err(err) => return Err(rejected(format!("seal could not be checked: {}", err))),
        }
        if !snapshot.frame.is_valid() || i64::from(snapshot.step) != i64::from(snapshot.frame.as_i32()) {
            return Err(rejected(format!(
                "invalid position: frame {} step {}",
                snapshot.frame, snapshot.step
            )));
        }
        if snapshot.episode >= self.num_episodes {
            return Err(rejected(format!(
                "episode {} is beyond the configured {}",
                snapshot.episode, self.num_episodes
            )));
        }
        if !self.cumulative_rewards.is_empty()
            && !snapshot
                .cumulative_rewards
                .keys()
                .eq(self.cumulative_rewards.keys())
        {
            return Err(rejected(format!(
                "agent set {:?} does not match local {:?}",
                snapshot.cumulative_rewards.keys().collect::<Vec<_>>(),
                self.cumulative_rewards.keys().collect::<Vec<_>>()
            )));
        }
        self.env
            .load_state(&snapshot.env_state)
            .map_err(|err| rejected(format!("environment refused state: {}", err)))?;

        self.episode = snapshot.episode;
        self.step = snapshot.step;
        self.frame = snapshot.frame;
        self.cumulative_rewards = snapshot.cumulative_rewards.clone();
        self.env_rng = snapshot.env_rng.clone();
        self.policy_rng = snapshot.policy_rng.clone();
        self.observations = snapshot.observations.clone();
        self.needs_reset = false;
        self.done = false;
        debug!(episode = self.episode, frame = %self.frame, "snapshot applied");
        Ok(())
    }

    /// Asks `policy` for `agent`'s action using the agent's latest observation and the
    /// policy generator. Returns `None` if the agent has no observation.
    pub fn evaluate_policy(
        &mut self,
        policy: &mut dyn Policy<T>,
        agent: &PeerId,
    ) -> Option<T::Action> {
        let observation = self.observations.get(agent)?;
        Some(policy.evaluate(observation, &mut self.policy_rng))
    }

    /// Replaces the set of peers every joint action must cover.
    pub fn set_expected_peers(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        self.expected = peers.into_iter().collect();
    }

    /// The peers every joint action must cover.
    #[must_use]
    pub fn expected_peers(&self) -> &[PeerId] {
        &self.expected
    }

    /// The current render projection.
    #[must_use]
    pub fn rendered(&self) -> Rendered<T::Render> {
        Rendered {
            state: self.env.render(),
            step: self.step,
        }
    }

    /// The seed of the last reset.
    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Zero-based index of the current episode.
    #[must_use]
    pub fn episode(&self) -> u32 {
        self.episode
    }

    /// Steps taken in the current episode.
    #[must_use]
    pub fn step_count(&self) -> u32 {
        self.step
    }

    /// The frame the next joint action will be executed at.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Number of episodes to play.
    #[must_use]
    pub fn num_episodes(&self) -> u32 {
        self.num_episodes
    }

    /// Cumulative reward per agent in the current episode.
    #[must_use]
    pub fn cumulative_rewards(&self) -> &BTreeMap<PeerId, f64> {
        &self.cumulative_rewards
    }

    /// The latest normalised observations.
    #[must_use]
    pub fn observations(&self) -> &Observations {
        &self.observations
    }

    /// Returns `true` until the current episode has been reset.
    #[must_use]
    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    /// Returns `true` once every episode has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
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
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::network::messages::joint_action;
    use crate::observation::{AgentValues, EnvReset, EnvStep, RawObservation, Tensor};
    use crate::rng::Rng;
    use crate::{EnvironmentError, FlatObservation, Info};

    struct CounterConfig;

    impl Config for CounterConfig {
        type Action = u8;
        type EnvState = CounterState;
        type Render = i64;
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct CounterState {
        total: i64,
        steps: u32,
    }

    /// Sums actions plus a random jitter; done after `horizon` steps.
    struct Counter {
        state: CounterState,
        horizon: u32,
    }

    fn agents<T: Clone>(value: T) -> BTreeMap<PeerId, T> {
        [("p1", value.clone()), ("p2", value)]
            .into_iter()
            .map(|(p, v)| (PeerId::from(p), v))
            .collect()
    }

    fn observe(total: i64) -> RawObservation {
        RawObservation::PerAgent(agents(Tensor::vector(vec![total as f64])))
    }

    impl Environment<CounterConfig> for Counter {
        fn reset(&mut self, _seed: u64, _rng: &mut Pcg32) -> Result<EnvReset, EnvironmentError> {
            self.state = CounterState::default();
            Ok(EnvReset {
                observation: observe(0),
                info: Info::new(),
            })
        }

        fn step(
            &mut self,
            joint_action: &JointAction<u8>,
            rng: &mut Pcg32,
        ) -> Result<EnvStep, EnvironmentError> {
            let jitter = rng.gen_range(0..3_u32) as i64;
            let sum: i64 = joint_action.values().map(|a| i64::from(*a)).sum();
            self.state.total += sum + jitter;
            self.state.steps += 1;
            let done = self.state.steps >= self.horizon;
            let rewards = joint_action
                .iter()
                .map(|(p, a)| (p.clone(), f64::from(*a)))
                .collect::<BTreeMap<_, _>>();
            Ok(EnvStep {
                observation: observe(self.state.total),
                rewards: AgentValues::PerAgent(rewards),
                terminated: AgentValues::PerAgent(agents(done)),
                truncated: AgentValues::PerAgent(agents(false)),
                info: Info::new(),
            })
        }

        fn render(&self) -> i64 {
            self.state.total
        }

        fn save_state(&self) -> Result<CounterState, EnvironmentError> {
            Ok(self.state.clone())
        }

        fn load_state(&mut self, state: &CounterState) -> Result<(), EnvironmentError> {
            if state.total < 0 {
                return Err(EnvironmentError::new("negative total"));
            }
            self.state = state.clone();
            Ok(())
        }
    }

    fn runner(horizon: u32, episodes: u32) -> DeterministicEnvironmentRunner<CounterConfig> {
        DeterministicEnvironmentRunner::new(
            Box::new(Counter {
                state: CounterState::default(),
                horizon,
            }),
            [PeerId::from("p1"), PeerId::from("p2")],
            episodes,
        )
    }

    fn actions(a: u8, b: u8) -> JointAction<u8> {
        joint_action([("p1", a), ("p2", b)])
    }

    #[test]
    fn step_before_reset_is_rejected() {
        let mut r = runner(3, 1);
        assert!(matches!(
            r.step(&actions(0, 0)),
            Err(LockstepError::Environment { .. })
        ));
    }

    #[test]
    fn reset_zeroes_position_and_rewards() {
        let mut r = runner(3, 1);
        let outcome = r.reset(42).unwrap();
        assert_eq!(r.frame(), Frame::new(0));
        assert_eq!(outcome.render.step, 0);
        assert_eq!(r.cumulative_rewards(), &agents(0.0));
        assert_eq!(
            outcome.observations[&PeerId::from("p1")],
            FlatObservation::Vector(vec![0.0])
        );
    }

    #[test]
    fn step_accumulates_and_reports_executed_frame() {
        let mut r = runner(3, 1);
        r.reset(42).unwrap();
        let first = r.step(&actions(1, 2)).unwrap();
        let second = r.step(&actions(1, 0)).unwrap();
        assert_eq!(first.frame, Frame::new(0));
        assert_eq!(second.frame, Frame::new(1));
        assert_eq!(r.frame(), Frame::new(2));
        assert_eq!(r.cumulative_rewards()[&PeerId::from("p1")], 2.0);
        assert_eq!(r.cumulative_rewards()[&PeerId::from("p2")], 2.0);
        assert!(!second.episode_complete);
    }

    #[test]
    fn incomplete_joint_action_is_rejected_without_side_effects() {
        let mut r = runner(3, 1);
        r.reset(1).unwrap();
        let before = r.digest().unwrap();
        let err = r.step(&joint_action([("p1", 1u8)])).unwrap_err();
        assert_eq!(
            err,
            LockstepError::IncompleteJointAction {
                frame: Frame::new(0),
                missing: vec![PeerId::from("p2")],
            }
        );
        assert_eq!(r.digest().unwrap(), before);
    }

    #[test]
    fn same_seed_same_digests() {
        let mut a = runner(5, 1);
        let mut b = runner(5, 1);
        a.reset(42).unwrap();
        b.reset(42).unwrap();
        for (x, y) in [(0, 1), (1, 1), (0, 0)] {
            a.step(&actions(x, y)).unwrap();
            b.step(&actions(x, y)).unwrap();
            assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = runner(5, 1);
        let mut b = runner(5, 1);
        a.reset(1).unwrap();
        b.reset(2).unwrap();
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn episode_lifecycle() {
        let mut r = runner(1, 2);
        r.reset(7).unwrap();
        assert!(r.step(&actions(0, 0)).unwrap().episode_complete);
        assert!(r.needs_reset());
        assert!(r.complete_episode());
        r.reset(7).unwrap();
        assert_eq!(r.episode(), 1);
        r.step(&actions(0, 0)).unwrap();
        assert!(!r.complete_episode());
        assert!(r.is_done());
        assert_eq!(r.reset(7).unwrap_err(), LockstepError::SessionDone);
    }

    #[test]
    fn snapshot_round_trip_reproduces_digests() {
        let mut host = runner(10, 1);
        let mut peer = runner(10, 1);
        host.reset(42).unwrap();
        peer.reset(42).unwrap();
        host.step(&actions(2, 2)).unwrap();
        peer.step(&actions(0, 0)).unwrap();
        assert_ne!(host.digest().unwrap(), peer.digest().unwrap());

        let snapshot = host.snapshot().unwrap();
        peer.apply_snapshot(&snapshot).unwrap();
        assert_eq!(host.digest().unwrap(), peer.digest().unwrap());
        for _ in 0..3 {
            host.step(&actions(1, 0)).unwrap();
            peer.step(&actions(1, 0)).unwrap();
            assert_eq!(host.digest().unwrap(), peer.digest().unwrap());
            assert_eq!(host.rendered(), peer.rendered());
        }
    }

    #[test]
    fn snapshot_restores_observations_for_policies() {
        struct Echo;
        impl Policy<CounterConfig> for Echo {
            fn evaluate(&mut self, observation: &FlatObservation, _rng: &mut Pcg32) -> u8 {
                observation.as_vector().map_or(0.0, |v| v[0]) as u8
            }
        }
        let mut host = runner(10, 1);
        let mut peer = runner(10, 1);
        host.reset(42).unwrap();
        peer.reset(42).unwrap();
        host.step(&actions(2, 2)).unwrap();
        peer.step(&actions(0, 0)).unwrap();
        assert_ne!(host.observations(), peer.observations());

        peer.apply_snapshot(&host.snapshot().unwrap()).unwrap();
        assert_eq!(peer.observations(), host.observations());
        let p1 = PeerId::from("p1");
        assert_eq!(
            peer.evaluate_policy(&mut Echo, &p1),
            host.evaluate_policy(&mut Echo, &p1)
        );
    }

    #[test]
    fn rejected_snapshot_leaves_runner_untouched() {
        let mut host = runner(10, 1);
        let mut peer = runner(10, 1);
        host.reset(42).unwrap();
        peer.reset(42).unwrap();
        host.step(&actions(2, 2)).unwrap();
        let before = peer.digest().unwrap();

        let mut tampered = host.snapshot().unwrap();
        tampered.frame = Frame::new(5);
        assert!(matches!(
            peer.apply_snapshot(&tampered),
            Err(LockstepError::SnapshotRejected { .. })
        ));
        assert_eq!(peer.digest().unwrap(), before);
    }

    #[test]
    fn environment_refusal_rejects_snapshot() {
        let mut host = runner(10, 1);
        let mut peer = runner(10, 1);
        host.reset(42).unwrap();
        peer.reset(42).unwrap();
        let projection = host.digest_projection();
        let bad = FullSnapshot::seal(
            projection,
            host.observations().clone(),
            CounterState { total: -1, steps: 0 },
        )
        .unwrap();
        let before = peer.digest().unwrap();
        assert!(peer.apply_snapshot(&bad).is_err());
        assert_eq!(peer.digest().unwrap(), before);
        assert_eq!(peer.rendered().state, 0);
    }

    #[test]
    fn policy_draws_from_policy_stream() {
        struct Echo;
        impl Policy<CounterConfig> for Echo {
            fn evaluate(&mut self, observation: &FlatObservation, rng: &mut Pcg32) -> u8 {
                let base = observation.as_vector().map_or(0.0, |v| v[0]) as u8;
                base + (rng.next_u32() % 2) as u8
            }
        }
        let mut a = runner(5, 1);
        let mut b = runner(5, 1);
        a.reset(3).unwrap();
        b.reset(3).unwrap();
        let p1 = PeerId::from("p1");
        assert_eq!(
            a.evaluate_policy(&mut Echo, &p1),
            b.evaluate_policy(&mut Echo, &p1)
        );
        assert_ne!(a.digest_projection().policy_rng, runner(5, 1).digest_projection().policy_rng);
        assert_eq!(a.evaluate_policy(&mut Echo, &PeerId::from("p9")), None);
    }
}
