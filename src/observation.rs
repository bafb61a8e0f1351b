//! Environment output and its normalisation.
//!
//! Environments may report observations, rewards and termination flags either as a single
//! unkeyed value or keyed per agent. Before anything else touches them the runner turns
//! every shape into a per-agent map, so the rest of the crate only deals with
//! `BTreeMap<PeerId, _>`:
//!
//! | Raw shape | Normalised |
//! |-----------|------------|
//! | single tensor | `{"human": flattened}` |
//! | per-agent tensors | `{agent: flattened}` |
//! | per-agent named components | `{agent: {component: flattened}}` |
//!
//! Tensors are flattened row-major and narrowed to `f32`.
//!
//! ```
//! use lockstep_sync::observation::{normalise_observation, RawObservation, Tensor};
//! use lockstep_sync::PeerId;
//!
//! let grid = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
//! let observations = normalise_observation(RawObservation::Single(grid));
//!
//! let human = &observations[&PeerId::default_agent()];
//! assert_eq!(human.as_vector(), Some(&[1.0_f32, 2.0, 3.0, 4.0][..]));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame_info::Info;
use crate::{EnvironmentError, PeerId};

/// A dense n-dimensional array of `f64` values stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Creates a tensor, checking that `data` holds exactly `product(shape)` values.
    ///
    /// An empty shape describes a scalar and needs exactly one value.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, EnvironmentError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EnvironmentError::new(format!(
                "tensor of shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Creates a one-dimensional tensor.
    #[must_use]
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Creates a zero-dimensional tensor holding one value.
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// The tensor's shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The tensor's values in row-major order.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Flattens row-major and narrows to `f32`.
    #[must_use]
    pub fn flatten(&self) -> Vec<f32> {
        self.data.iter().map(|&v| v as f32).collect()
    }
}

/// An observation exactly as the environment reported it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawObservation {
    /// One tensor for a single-agent environment.
    Single(Tensor),
    /// One tensor per agent.
    PerAgent(BTreeMap<PeerId, Tensor>),
    /// Named component tensors per agent.
    PerAgentComponents(BTreeMap<PeerId, BTreeMap<String, Tensor>>),
}

/// One agent's observation after normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlatObservation {
    /// A single flattened vector.
    Vector(Vec<f32>),
    /// Flattened vectors keyed by component name.
    Components(BTreeMap<String, Vec<f32>>),
}

impl FlatObservation {
    /// Returns the vector if this observation has no components.
    #[must_use]
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Self::Vector(values) => Some(values),
            Self::Components(_) => None,
        }
    }

    /// Returns the named component, if this observation has components.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&[f32]> {
        match self {
            Self::Vector(_) => None,
            Self::Components(components) => components.get(name).map(Vec::as_slice),
        }
    }

    /// Total number of values across all components.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Vector(values) => values.len(),
            Self::Components(components) => components.values().map(Vec::len).sum(),
        }
    }

    /// Returns `true` if the observation holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalised observations for every agent.
pub type Observations = BTreeMap<PeerId, FlatObservation>;

/// Flattens an observation into a per-agent map.
#[must_use]
pub fn normalise_observation(raw: RawObservation) -> Observations {
    match raw {
        RawObservation::Single(tensor) => {
            let mut observations = BTreeMap::new();
            observations.insert(
                PeerId::default_agent(),
                FlatObservation::Vector(tensor.flatten()),
            );
            observations
        },
        RawObservation::PerAgent(per_agent) => per_agent
            .into_iter()
            .map(|(agent, tensor)| (agent, FlatObservation::Vector(tensor.flatten())))
            .collect(),
        RawObservation::PerAgentComponents(per_agent) => per_agent
            .into_iter()
            .map(|(agent, components)| {
                let flat = components
                    .into_iter()
                    .map(|(name, tensor)| (name, tensor.flatten()))
                    .collect();
                (agent, FlatObservation::Components(flat))
            })
            .collect(),
    }
}

/// A value reported either once for the whole environment or once per agent.
///
/// Used for rewards and for the terminated and truncated flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentValues<T> {
    /// One value, filed under [`PeerId::DEFAULT_AGENT`].
    Single(T),
    /// One value per agent.
    PerAgent(BTreeMap<PeerId, T>),
}

impl<T> AgentValues<T> {
    /// Converts into a per-agent map.
    #[must_use]
    pub fn normalise(self) -> BTreeMap<PeerId, T> {
        match self {
            Self::Single(value) => {
                let mut map = BTreeMap::new();
                map.insert(PeerId::default_agent(), value);
                map
            },
            Self::PerAgent(map) => map,
        }
    }
}

impl<T> From<BTreeMap<PeerId, T>> for AgentValues<T> {
    fn from(map: BTreeMap<PeerId, T>) -> Self {
        Self::PerAgent(map)
    }
}

/// What [`Environment::reset`](crate::Environment::reset) reports.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvReset {
    /// The initial observation.
    pub observation: RawObservation,
    /// Auxiliary information.
    pub info: Info,
}

/// What [`Environment::step`](crate::Environment::step) reports.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvStep {
    /// The observation after the step.
    pub observation: RawObservation,
    /// Reward earned during the step.
    pub rewards: AgentValues<f64>,
    /// Whether each agent reached a terminal state.
    pub terminated: AgentValues<bool>,
    /// Whether each agent was cut off by a time limit.
    pub truncated: AgentValues<bool>,
    /// Auxiliary information.
    pub info: Info,
}

/// Returns `true` when every agent is terminated or every agent is truncated.
///
/// An empty map never completes an episode.
#[must_use]
pub fn episode_complete(
    terminated: &BTreeMap<PeerId, bool>,
    truncated: &BTreeMap<PeerId, bool>,
) -> bool {
    let all_terminated = !terminated.is_empty() && terminated.values().all(|&done| done);
    let all_truncated = !truncated.is_empty() && truncated.values().all(|&done| done);
    all_terminated || all_truncated
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

    fn agents<T: Clone>(pairs: &[(&str, T)]) -> BTreeMap<PeerId, T> {
        pairs
            .iter()
            .map(|(id, v)| (PeerId::from(*id), v.clone()))
            .collect()
    }

    #[test]
    fn tensor_rejects_shape_mismatch() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::new(Vec::new(), vec![1.0]).is_ok());
    }

    #[test]
    fn single_tensor_goes_under_human() {
        let obs = normalise_observation(RawObservation::Single(Tensor::scalar(0.5)));
        assert_eq!(obs.len(), 1);
        assert_eq!(
            obs[&PeerId::default_agent()],
            FlatObservation::Vector(vec![0.5])
        );
    }

    #[test]
    fn per_agent_tensors_keep_their_keys() {
        let raw = RawObservation::PerAgent(agents(&[
            ("p2", Tensor::vector(vec![2.0])),
            ("p1", Tensor::vector(vec![1.0, 1.5])),
        ]));
        let obs = normalise_observation(raw);
        let keys: Vec<&str> = obs.keys().map(PeerId::as_str).collect();
        assert_eq!(keys, vec!["p1", "p2"]);
        assert_eq!(obs["p1"].as_vector(), Some(&[1.0_f32, 1.5][..]));
    }

    #[test]
    fn components_are_flattened_individually() {
        let mut components = BTreeMap::new();
        components.insert(
            "grid".to_owned(),
            Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        components.insert("pos".to_owned(), Tensor::vector(vec![7.0, 8.0]));
        let raw = RawObservation::PerAgentComponents(agents(&[("p1", components)]));
        let obs = normalise_observation(raw);

        assert_eq!(obs["p1"].component("grid"), Some(&[1.0_f32, 2.0, 3.0, 4.0][..]));
        assert_eq!(obs["p1"].component("pos"), Some(&[7.0_f32, 8.0][..]));
        assert_eq!(obs["p1"].len(), 6);
        assert!(obs["p1"].as_vector().is_none());
    }

    #[test]
    fn narrowing_to_f32() {
        let tensor = Tensor::vector(vec![0.1]);
        assert_eq!(tensor.flatten(), vec![0.1_f32]);
    }

    #[test]
    fn agent_values_normalise() {
        assert_eq!(
            AgentValues::Single(1.0).normalise(),
            agents(&[("human", 1.0)])
        );
        let per_agent = agents(&[("p1", true), ("p2", false)]);
        assert_eq!(
            AgentValues::from(per_agent.clone()).normalise(),
            per_agent
        );
    }

    #[test]
    fn episode_completion_rules() {
        let all = agents(&[("p1", true), ("p2", true)]);
        let some = agents(&[("p1", true), ("p2", false)]);
        let none = agents(&[("p1", false), ("p2", false)]);

        assert!(episode_complete(&all, &none));
        assert!(episode_complete(&none, &all));
        assert!(!episode_complete(&some, &some));
        // one agent terminated and the other truncated is not complete
        assert!(!episode_complete(
            &agents(&[("p1", true), ("p2", false)]),
            &agents(&[("p1", false), ("p2", true)])
        ));
        assert!(!episode_complete(&BTreeMap::new(), &BTreeMap::new()));
    }
}
