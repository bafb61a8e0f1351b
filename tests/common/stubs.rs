//! A small deterministic multi-agent environment for integration tests.
//!
//! Every agent walks along a line. Each step moves it by its action plus a jitter drawn
//! from the environment generator, and the reward is the distance moved. The episode
//! terminates for everyone after `horizon` steps.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use lockstep_sync::observation::{AgentValues, EnvReset, EnvStep, RawObservation, Tensor};
use lockstep_sync::rng::Rng;
use lockstep_sync::{
    Config, Environment, EnvironmentError, FlatObservation, Info, JointAction, Pcg32, PeerId,
    Policy, RenderSink, Rendered,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Config for [`LineWalk`].
pub struct LineConfig;

impl Config for LineConfig {
    type Action = u8;
    type EnvState = LineState;
    type Render = Vec<i64>;
}

/// Internal state of [`LineWalk`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineState {
    pub positions: BTreeMap<PeerId, i64>,
    pub steps: u32,
}

/// Shared handle used to push a peer's environment off course.
///
/// The stored amount is added to the first agent's reward and position on the next step
/// and then cleared, which makes that peer's digest and observations differ from
/// everyone else's.
#[derive(Debug, Clone, Default)]
pub struct Drift(Arc<AtomicI64>);

impl Drift {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, amount: i64) {
        self.0.store(amount, Ordering::SeqCst);
    }

    fn take(&self) -> i64 {
        self.0.swap(0, Ordering::SeqCst)
    }
}

pub struct LineWalk {
    agents: Vec<PeerId>,
    horizon: u32,
    state: LineState,
    drift: Drift,
    fail_step_at: Option<u32>,
}

impl LineWalk {
    pub fn new<P: Into<PeerId>>(agents: impl IntoIterator<Item = P>, horizon: u32) -> Self {
        let mut agents: Vec<PeerId> = agents.into_iter().map(Into::into).collect();
        agents.sort();
        agents.dedup();
        Self {
            agents,
            horizon,
            state: LineState::default(),
            drift: Drift::new(),
            fail_step_at: None,
        }
    }

    pub fn with_drift(mut self, drift: Drift) -> Self {
        self.drift = drift;
        self
    }

    /// Makes `step` fail once the episode reaches `steps`.
    pub fn failing_at(mut self, steps: u32) -> Self {
        self.fail_step_at = Some(steps);
        self
    }

    fn observation(&self) -> RawObservation {
        let per_agent = self
            .state
            .positions
            .iter()
            .map(|(agent, pos)| {
                let tensor = Tensor::vector(vec![*pos as f64, f64::from(self.state.steps)]);
                (agent.clone(), tensor)
            })
            .collect();
        RawObservation::PerAgent(per_agent)
    }

    fn per_agent<V: Copy>(&self, value: V) -> AgentValues<V> {
        AgentValues::PerAgent(self.agents.iter().map(|a| (a.clone(), value)).collect())
    }
}

impl Environment<LineConfig> for LineWalk {
    fn reset(&mut self, _seed: u64, rng: &mut Pcg32) -> Result<EnvReset, EnvironmentError> {
        self.state = LineState {
            positions: self
                .agents
                .iter()
                .map(|agent| (agent.clone(), i64::from(rng.gen_range(0..4))))
                .collect(),
            steps: 0,
        };
        Ok(EnvReset {
            observation: self.observation(),
            info: Info::new(),
        })
    }

    fn step(
        &mut self,
        joint_action: &JointAction<u8>,
        rng: &mut Pcg32,
    ) -> Result<EnvStep, EnvironmentError> {
        if self.fail_step_at == Some(self.state.steps) {
            return Err(EnvironmentError::new("line walk broke"));
        }
        let drift = self.drift.take();
        let mut rewards = BTreeMap::new();
        for agent in &self.agents {
            // agents without an action stand still
            let moved = match joint_action.get(agent) {
                Some(action) => i64::from(*action) + i64::from(rng.gen_range(0..2)),
                None => 0,
            };
            if let Some(pos) = self.state.positions.get_mut(agent) {
                *pos += moved;
            }
            rewards.insert(agent.clone(), moved as f64);
        }
        if drift != 0 {
            if let Some(first) = self.agents.first() {
                *rewards.entry(first.clone()).or_insert(0.0) += drift as f64;
                if let Some(pos) = self.state.positions.get_mut(first) {
                    *pos += drift;
                }
            }
        }
        self.state.steps += 1;
        let done = self.state.steps >= self.horizon;

        let mut info = Info::new();
        info.insert("steps".to_owned(), i64::from(self.state.steps).into());
        Ok(EnvStep {
            observation: self.observation(),
            rewards: AgentValues::PerAgent(rewards),
            terminated: self.per_agent(done),
            truncated: self.per_agent(false),
            info,
        })
    }

    fn render(&self) -> Vec<i64> {
        self.state.positions.values().copied().collect()
    }

    fn save_state(&self) -> Result<LineState, EnvironmentError> {
        Ok(self.state.clone())
    }

    fn load_state(&mut self, state: &LineState) -> Result<(), EnvironmentError> {
        if state.positions.keys().ne(self.agents.iter()) {
            return Err(EnvironmentError::new("snapshot has a different agent set"));
        }
        self.state = state.clone();
        Ok(())
    }
}

/// Picks an action from the policy generator, ignoring the observation.
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl Policy<LineConfig> for RandomPolicy {
    fn evaluate(&mut self, _observation: &FlatObservation, rng: &mut Pcg32) -> u8 {
        rng.gen_range(0..3) as u8
    }
}

/// Steps toward the agent's observed position, plus a draw from the policy generator.
#[derive(Debug, Default)]
pub struct FollowPolicy;

impl Policy<LineConfig> for FollowPolicy {
    fn evaluate(&mut self, observation: &FlatObservation, rng: &mut Pcg32) -> u8 {
        let position = observation.as_vector().map_or(0.0, |v| v[0]) as i64;
        (position.rem_euclid(3) as u8 + rng.gen_range(0..2) as u8) % 3
    }
}

/// Records every presented frame so tests can inspect what the UI saw.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Rendered<Vec<i64>>>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Rendered<Vec<i64>>> {
        self.frames.lock().clone()
    }

    pub fn last_step(&self) -> Option<u32> {
        self.frames.lock().last().map(|r| r.step)
    }
}

impl RenderSink<LineConfig> for RecordingSink {
    fn present(&mut self, rendered: &Rendered<Vec<i64>>) {
        self.frames.lock().push(rendered.clone());
    }
}
