//! Values produced by resets and steps, and the state captured for digests and
//! snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checksum::{compute_digest, ChecksumError, StateDigest};
use crate::observation::Observations;
use crate::rng::Pcg32;
use crate::{Frame, JointAction, PeerId};

/// A value in an environment's auxiliary info map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    /// A flag.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// Free text.
    Text(String),
    /// A list of values.
    List(Vec<InfoValue>),
}

impl From<bool> for InfoValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for InfoValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for InfoValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for InfoValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for InfoValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Auxiliary information reported alongside observations.
pub type Info = BTreeMap<String, InfoValue>;

/// The render projection handed to the UI together with the step counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered<R> {
    /// Environment-specific render state.
    pub state: R,
    /// Steps taken in the current episode.
    pub step: u32,
}

/// Result of resetting the environment at the start of an episode.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutcome<R> {
    /// Normalised initial observations.
    pub observations: Observations,
    /// Auxiliary information.
    pub info: Info,
    /// The initial render projection.
    pub render: Rendered<R>,
}

/// Result of executing one joint action.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome<R> {
    /// The frame the joint action was executed at.
    pub frame: Frame,
    /// Normalised observations after the step.
    pub observations: Observations,
    /// Reward per agent for this step.
    pub rewards: BTreeMap<PeerId, f64>,
    /// Terminal flag per agent.
    pub terminated: BTreeMap<PeerId, bool>,
    /// Truncation flag per agent.
    pub truncated: BTreeMap<PeerId, bool>,
    /// Auxiliary information.
    pub info: Info,
    /// Render projection after the step.
    pub render: Rendered<R>,
    /// Every agent terminated, or every agent was truncated.
    pub episode_complete: bool,
}

/// One frame of episode data accumulated by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord<A> {
    /// The frame reached by executing the actions, one past [`StepOutcome::frame`].
    /// The first record of an episode is frame 1.
    pub frame: Frame,
    /// Observations after the step.
    pub observations: Observations,
    /// The joint action that was executed.
    pub actions: JointAction<A>,
    /// Reward per agent for this step.
    pub rewards: BTreeMap<PeerId, f64>,
    /// Terminal flag per agent.
    pub terminated: BTreeMap<PeerId, bool>,
    /// Truncation flag per agent.
    pub truncated: BTreeMap<PeerId, bool>,
    /// Auxiliary information.
    pub info: Info,
}

impl<A: Clone> FrameRecord<A> {
    /// Builds a record from an executed step.
    #[must_use]
    pub fn from_step<R>(outcome: &StepOutcome<R>, actions: &JointAction<A>) -> Self {
        Self {
            frame: outcome.frame + 1,
            observations: outcome.observations.clone(),
            actions: actions.clone(),
            rewards: outcome.rewards.clone(),
            terminated: outcome.terminated.clone(),
            truncated: outcome.truncated.clone(),
            info: outcome.info.clone(),
        }
    }
}

/// The canonical input of a state digest.
///
/// Field order is fixed by the struct and key order by `BTreeMap`, so every peer in the
/// same logical state serializes this to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestProjection {
    /// Zero-based episode index.
    pub episode: u32,
    /// Steps taken in the current episode.
    pub step: u32,
    /// Current frame.
    pub frame: Frame,
    /// Cumulative reward per agent.
    pub cumulative_rewards: BTreeMap<PeerId, f64>,
    /// Environment generator state.
    pub env_rng: Pcg32,
    /// Policy generator state.
    pub policy_rng: Pcg32,
}

impl DigestProjection {
    /// Computes the digest of this projection.
    pub fn digest(&self) -> Result<StateDigest, ChecksumError> {
        compute_digest(self)
    }
}

/// Everything needed to resume a diverged peer at the host's state.
///
/// The host seals the snapshot with a digest of its own contents. A receiver verifies
/// the seal before touching any local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSnapshot<S> {
    /// Zero-based episode index.
    pub episode: u32,
    /// Steps taken in the current episode.
    pub step: u32,
    /// The frame to resume from.
    pub frame: Frame,
    /// Cumulative reward per agent.
    pub cumulative_rewards: BTreeMap<PeerId, f64>,
    /// Environment generator state.
    pub env_rng: Pcg32,
    /// Policy generator state.
    pub policy_rng: Pcg32,
    /// The latest normalised observations, which policies read after the restore.
    pub observations: Observations,
    /// The environment's own state.
    pub env_state: S,
    seal: StateDigest,
}

impl<S: Serialize> FullSnapshot<S> {
    /// Builds a snapshot from a digest projection, the latest observations and the
    /// environment state, and seals it.
    pub fn seal(
        projection: DigestProjection,
        observations: Observations,
        env_state: S,
    ) -> Result<Self, ChecksumError> {
        let DigestProjection {
            episode,
            step,
            frame,
            cumulative_rewards,
            env_rng,
            policy_rng,
        } = projection;
        let mut snapshot = Self {
            episode,
            step,
            frame,
            cumulative_rewards,
            env_rng,
            policy_rng,
            observations,
            env_state,
            seal: StateDigest::default(),
        };
        snapshot.seal = snapshot.content_digest()?;
        Ok(snapshot)
    }

    /// The digest the host sealed the snapshot with.
    #[must_use]
    pub fn seal_digest(&self) -> StateDigest {
        self.seal
    }

    /// Returns `Ok(true)` if the contents still match the seal.
    pub fn verify(&self) -> Result<bool, ChecksumError> {
        Ok(self.content_digest()? == self.seal)
    }

    /// The digest projection this snapshot restores.
    #[must_use]
    pub fn projection(&self) -> DigestProjection {
        DigestProjection {
            episode: self.episode,
            step: self.step,
            frame: self.frame,
            cumulative_rewards: self.cumulative_rewards.clone(),
            env_rng: self.env_rng.clone(),
            policy_rng: self.policy_rng.clone(),
        }
    }

    fn content_digest(&self) -> Result<StateDigest, ChecksumError> {
        compute_digest(&(
            self.episode,
            self.step,
            self.frame,
            &self.cumulative_rewards,
            &self.env_rng,
            &self.policy_rng,
            &self.observations,
            &self.env_state,
        ))
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::codec::{decode_value, encode};
    use crate::observation::FlatObservation;

    fn projection() -> DigestProjection {
        let mut cumulative_rewards = BTreeMap::new();
        cumulative_rewards.insert(PeerId::from("p1"), 2.5);
        cumulative_rewards.insert(PeerId::from("p2"), -1.0);
        DigestProjection {
            episode: 1,
            step: 10,
            frame: Frame::new(10),
            cumulative_rewards,
            env_rng: Pcg32::with_stream(42, Pcg32::ENVIRONMENT_STREAM),
            policy_rng: Pcg32::with_stream(42, Pcg32::POLICY_STREAM),
        }
    }

    fn observations() -> Observations {
        let mut observations = Observations::new();
        observations.insert(PeerId::from("p1"), FlatObservation::Vector(vec![1.0, 0.5]));
        observations.insert(PeerId::from("p2"), FlatObservation::Vector(vec![0.0, 0.0]));
        observations
    }

    #[test]
    fn projection_digest_tracks_rng_state() {
        let before = projection();
        let mut after = before.clone();
        let _ = after.env_rng.next_u32();
        assert_ne!(before.digest().unwrap(), after.digest().unwrap());
    }

    #[test]
    fn sealed_snapshot_verifies() {
        let snapshot = FullSnapshot::seal(projection(), observations(), vec![1u8, 2, 3]).unwrap();
        assert!(snapshot.verify().unwrap());
        assert_eq!(snapshot.projection(), projection());
    }

    #[test]
    fn tampered_snapshot_fails_verification() {
        let mut snapshot = FullSnapshot::seal(projection(), observations(), vec![1u8, 2, 3]).unwrap();
        snapshot.env_state.push(4);
        assert!(!snapshot.verify().unwrap());

        let mut snapshot = FullSnapshot::seal(projection(), observations(), vec![1u8]).unwrap();
        snapshot.frame = Frame::new(11);
        assert!(!snapshot.verify().unwrap());

        let mut snapshot = FullSnapshot::seal(projection(), observations(), vec![1u8]).unwrap();
        snapshot
            .observations
            .insert(PeerId::from("p2"), FlatObservation::Vector(vec![9.0, 9.0]));
        assert!(!snapshot.verify().unwrap());
    }

    #[test]
    fn snapshot_survives_the_wire() {
        let snapshot = FullSnapshot::seal(projection(), observations(), vec![9u8; 16]).unwrap();
        let bytes = encode(&snapshot).unwrap();
        let decoded: FullSnapshot<Vec<u8>> = decode_value(&bytes).unwrap();
        assert!(decoded.verify().unwrap());
        assert_eq!(decoded.seal_digest(), snapshot.seal_digest());
    }

    #[test]
    fn info_values_convert() {
        let mut info = Info::new();
        info.insert("score".to_owned(), 3_i64.into());
        info.insert("label".to_owned(), "goal".into());
        info.insert(
            "flags".to_owned(),
            InfoValue::List(vec![true.into(), 0.5.into()]),
        );
        let bytes = encode(&info).unwrap();
        let decoded: Info = decode_value(&bytes).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn frame_record_carries_the_frame_reached() {
        let outcome = StepOutcome {
            frame: Frame::new(0),
            observations: observations(),
            rewards: BTreeMap::new(),
            terminated: BTreeMap::new(),
            truncated: BTreeMap::new(),
            info: Info::new(),
            render: Rendered { state: (), step: 1 },
            episode_complete: false,
        };
        let actions: JointAction<u8> = [(PeerId::from("p1"), 2)].into_iter().collect();
        let record = FrameRecord::from_step(&outcome, &actions);
        assert_eq!(record.frame, Frame::new(1));
        assert_eq!(record.actions, actions);
        assert_eq!(record.observations, outcome.observations);
    }
}
