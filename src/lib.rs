//! # lockstep-sync
//!
//! Deterministic lockstep synchronization for peers that each run their own copy of a
//! seeded simulation.
//!
//! No peer is authoritative over the simulation. Every peer submits its local action for
//! the current frame to a relay, waits until the relay announces the complete joint action,
//! and then steps its own environment with it. Because every environment is seeded the
//! same way and fed the same joint actions, the copies stay identical. Periodic digest
//! verification catches the cases where they do not, and a full snapshot from the host
//! brings a diverged peer back.
//!
//! Like the request-driven control flow it is modelled on, the session never blocks:
//! [`LockstepSession::step`] returns [`StepProgress::AwaitingJointAction`] until the relay
//! has delivered everything needed to advance, and the caller simply tries again after
//! [`LockstepSession::poll_remote_clients`].
//!
//! ```ignore
//! let mut session = SessionBuilder::<MyConfig>::new()
//!     .with_session_id("game-7")
//!     .with_local_peer("p1")
//!     .with_expected_peers(["p1", "p2"])
//!     .start_session(socket, || MyEnvironment::new())?;
//!
//! loop {
//!     session.poll_remote_clients();
//!     match session.step(next_action())? {
//!         StepProgress::Stepped(outcome) => render(&outcome.render),
//!         StepProgress::Done => break,
//!         _ => {},
//!     }
//!     for event in session.events() {
//!         // handle LockstepEvent
//!     }
//! }
//! ```

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use checksum::StateDigest;
pub use error::{EnvironmentError, LockstepError};
pub use frame_info::{
    DigestProjection, FrameRecord, FullSnapshot, Info, InfoValue, Rendered, ResetOutcome,
    StepOutcome,
};
pub use network::messages::{InboundMessage, OutboundMessage};
pub use observation::{
    AgentValues, EnvReset, EnvStep, FlatObservation, Observations, RawObservation, Tensor,
};
pub use rng::Pcg32;
pub use runner::DeterministicEnvironmentRunner;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{SessionConfig, VerificationMode};
pub use sessions::event_drain::EventDrain;
pub use sessions::host::{HostCoordinator, Role};
pub use sessions::lockstep_session::{LockstepSession, StepProgress};
pub use sessions::resync::ResyncState;

pub mod checksum;
#[doc(hidden)]
pub mod error;
pub mod frame_info;
pub mod hash;
pub mod observation;
/// Deterministic random number generator based on PCG32.
///
/// Environments and policies draw all their randomness from these generators so that
/// every peer produces the same trajectory from the same seed.
pub mod rng;
pub mod runner;
pub mod telemetry;
pub mod sessions {
    //! The lockstep session and the protocol components it wires together.
    pub mod barrier;
    pub mod builder;
    pub mod config;
    pub mod episode_log;
    pub mod event_drain;
    pub mod host;
    pub mod lockstep_session;
    pub mod resync;
    pub mod verifier;
}
pub mod network {
    //! Relay message types and the binary codec.

    /// Binary codec for relay messages and state projections.
    ///
    /// Provides centralized encoding and decoding using bincode with fixed-int encoding.
    pub mod codec;
    pub mod messages;
}

/// Convenient re-exports for session code.
pub mod prelude {
    pub use crate::{
        AgentValues, Config, DeterministicEnvironmentRunner, EnvReset, EnvStep, Environment,
        EnvironmentError, FlatObservation, Frame, InboundMessage, JointAction, LockstepError,
        LockstepEvent, LockstepSession, OutboundMessage, PeerId, Policy, RawObservation,
        RelaySocket, RenderSink, Role, SessionBuilder, SessionConfig, SessionId, SessionState,
        StateDigest, StepProgress, Tensor, VerificationMode,
    };
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame is a single lockstep tick.
///
/// Frames count executed steps within an episode. They start at 0 after every reset and
/// increment once per executed joint action. The special value [`NULL_FRAME`] (-1)
/// represents "no frame".
///
/// # Examples
///
/// ```
/// use lockstep_sync::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
///
/// let next_frame = frame + 1;
/// assert_eq!(next_frame.as_i32(), 1);
/// assert!(next_frame > frame);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Self = Self(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns the following frame.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, rhs: i32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// The stable identity of a participant.
///
/// Peer ids double as agent ids: joint actions, rewards and observations are all keyed by
/// them. Environments that report a single unkeyed value have it filed under
/// [`PeerId::DEFAULT_AGENT`].
///
/// ```
/// use lockstep_sync::PeerId;
///
/// let peer = PeerId::from("p1");
/// assert_eq!(peer.as_str(), "p1");
/// assert_eq!(PeerId::default_agent().as_str(), PeerId::DEFAULT_AGENT);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Agent id used for environments that report a single observation or reward.
    pub const DEFAULT_AGENT: &'static str = "human";

    /// Creates a peer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id under which unkeyed environment output is stored.
    #[must_use]
    pub fn default_agent() -> Self {
        Self(Self::DEFAULT_AGENT.to_owned())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::borrow::Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identifier of the game session. Every outbound message is tagged with it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One action per expected peer for a single frame.
///
/// A `BTreeMap` so that iteration order, and therefore any order-dependent effect inside
/// the environment, is the same on every peer.
pub type JointAction<A> = BTreeMap<PeerId, A>;

// #############
// #   ENUMS   #
// #############

/// A session is always in one of these states. Query it via [`LockstepSession::current_state`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Created, but no host election has been received yet.
    Initializing,
    /// Elected and seeded; the next step resets the environment.
    Ready,
    /// Stepping frames in lockstep.
    Running,
    /// A divergence was reported; nothing advances until a snapshot is applied.
    Paused,
    /// A snapshot is being served (host) or applied (peer).
    Resyncing,
    /// All configured episodes have completed.
    Done,
    /// The environment could not be created. Terminal.
    Failed,
}

/// Notifications that you can receive from the session. Handling them is up to the user.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`; always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum LockstepEvent {
    /// The relay assigned roles and the shared seed.
    HostElected {
        /// The elected host.
        host: PeerId,
        /// Whether the local peer is the host.
        is_host: bool,
        /// The shared seed.
        seed: u64,
    },
    /// The local peer became host after the previous host left.
    Promoted {
        /// The frame the session was at when promoted.
        frame: Frame,
    },
    /// The local peer was host and no longer is. Its partial episode buffer was discarded.
    Demoted {
        /// The new host.
        new_host: PeerId,
    },
    /// Another peer took over as host.
    HostChanged {
        /// The new host.
        new_host: PeerId,
    },
    /// The environment was reset for a new episode.
    EpisodeStarted {
        /// Zero-based episode index.
        episode: u32,
    },
    /// Every agent terminated or every agent was truncated.
    EpisodeCompleted {
        /// Zero-based episode index.
        episode: u32,
        /// Final cumulative reward per agent.
        cumulative_rewards: BTreeMap<PeerId, f64>,
    },
    /// The host sent the accumulated episode data to the relay.
    EpisodeFlushed {
        /// Zero-based episode index.
        episode: u32,
        /// Number of frame records sent.
        records: usize,
    },
    /// A state digest was submitted for verification.
    DigestSubmitted {
        /// The frame the digest describes.
        frame: Frame,
        /// The digest.
        digest: StateDigest,
    },
    /// The relay reported that peers disagree about the state.
    DivergenceDetected {
        /// The frame of the mismatching digests.
        frame: Frame,
    },
    /// The host served its full state for a resync.
    SnapshotServed {
        /// The frame of the snapshot.
        frame: Frame,
    },
    /// A snapshot from the host was applied; the session resumes from its frame.
    SnapshotApplied {
        /// The frame the session resumes from.
        frame: Frame,
    },
    /// A snapshot was rejected. The session stays paused.
    ResyncFailed {
        /// The frame of the divergence.
        frame: Frame,
        /// Why the snapshot was rejected.
        reason: String,
    },
    /// The joint action for a frame has not arrived within the configured warning window.
    JointActionStalled {
        /// The awaited frame.
        frame: Frame,
        /// Milliseconds waited so far.
        waited_ms: u128,
    },
    /// All configured episodes have completed.
    SessionDone,
}

// #############
// #  TRAITS   #
// #############

//  a config trait that bundles all generics

/// Compile time parameterization for sessions.
///
/// # Example
///
/// ```
/// use lockstep_sync::Config;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// struct GridState {
///     positions: Vec<(i32, i32)>,
/// }
///
/// struct GridConfig;
///
/// impl Config for GridConfig {
///     type Action = u8;
///     type EnvState = GridState;
///     type Render = Vec<(i32, i32)>;
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait Config: 'static + Send + Sync {
    /// The per-agent action. This is what peers submit to the relay every frame.
    type Action: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync;

    /// The environment's own serialized state, carried in full snapshots.
    type EnvState: Clone + Debug + Serialize + DeserializeOwned + Send + Sync;

    /// The render projection handed to the UI. Opaque to the protocol.
    type Render: Clone + Debug + Send + Sync;
}

/// Compile time parameterization for sessions.
#[cfg(not(feature = "sync-send"))]
pub trait Config: 'static {
    /// The per-agent action. This is what peers submit to the relay every frame.
    type Action: Clone + PartialEq + Debug + Serialize + DeserializeOwned;

    /// The environment's own serialized state, carried in full snapshots.
    type EnvState: Clone + Debug + Serialize + DeserializeOwned;

    /// The render projection handed to the UI. Opaque to the protocol.
    type Render: Clone + Debug;
}

/// The channel to the relay.
///
/// Implement this with whatever transport you use. Sends are fire-and-forget; the protocol
/// tolerates delay but assumes messages between one peer and the relay are delivered in
/// order.
#[cfg(feature = "sync-send")]
pub trait RelaySocket<A, S>: Send + Sync {
    /// Sends a message to the relay.
    fn send(&mut self, msg: &OutboundMessage<A, S>);

    /// Returns all messages received since the last time this method was called.
    fn receive_all_messages(&mut self) -> Vec<InboundMessage<A, S>>;
}

/// The channel to the relay.
///
/// Implement this with whatever transport you use. Sends are fire-and-forget; the protocol
/// tolerates delay but assumes messages between one peer and the relay are delivered in
/// order.
#[cfg(not(feature = "sync-send"))]
pub trait RelaySocket<A, S> {
    /// Sends a message to the relay.
    fn send(&mut self, msg: &OutboundMessage<A, S>);

    /// Returns all messages received since the last time this method was called.
    fn receive_all_messages(&mut self) -> Vec<InboundMessage<A, S>>;
}

/// A stateful simulation that every peer runs a private copy of.
///
/// Implementations must be deterministic: the same seed, the same generator draws and the
/// same sequence of joint actions must produce the same outputs on every peer. All
/// randomness must come from the provided generator.
#[cfg(feature = "sync-send")]
pub trait Environment<T: Config>: Send + Sync {
    /// Starts a new episode.
    fn reset(&mut self, seed: u64, rng: &mut Pcg32) -> Result<EnvReset, EnvironmentError>;

    /// Advances exactly one tick with the given joint action.
    fn step(
        &mut self,
        joint_action: &JointAction<T::Action>,
        rng: &mut Pcg32,
    ) -> Result<EnvStep, EnvironmentError>;

    /// Produces the current render projection.
    fn render(&self) -> T::Render;

    /// Captures the environment's internal state for a full snapshot.
    fn save_state(&self) -> Result<T::EnvState, EnvironmentError>;

    /// Restores internal state captured by [`save_state`](Self::save_state).
    ///
    /// Must leave the environment unchanged when it returns `Err`.
    fn load_state(&mut self, state: &T::EnvState) -> Result<(), EnvironmentError>;
}

/// A stateful simulation that every peer runs a private copy of.
///
/// Implementations must be deterministic: the same seed, the same generator draws and the
/// same sequence of joint actions must produce the same outputs on every peer. All
/// randomness must come from the provided generator.
#[cfg(not(feature = "sync-send"))]
pub trait Environment<T: Config> {
    /// Starts a new episode.
    fn reset(&mut self, seed: u64, rng: &mut Pcg32) -> Result<EnvReset, EnvironmentError>;

    /// Advances exactly one tick with the given joint action.
    fn step(
        &mut self,
        joint_action: &JointAction<T::Action>,
        rng: &mut Pcg32,
    ) -> Result<EnvStep, EnvironmentError>;

    /// Produces the current render projection.
    fn render(&self) -> T::Render;

    /// Captures the environment's internal state for a full snapshot.
    fn save_state(&self) -> Result<T::EnvState, EnvironmentError>;

    /// Restores internal state captured by [`save_state`](Self::save_state).
    ///
    /// Must leave the environment unchanged when it returns `Err`.
    fn load_state(&mut self, state: &T::EnvState) -> Result<(), EnvironmentError>;
}

/// Chooses an action for one agent from its observation.
///
/// Inference internals are opaque to the protocol. Any randomness must come from the
/// provided generator, which is the runner's policy stream.
pub trait Policy<T: Config> {
    /// Returns the action for the given observation.
    fn evaluate(&mut self, observation: &FlatObservation, rng: &mut Pcg32) -> T::Action;
}

/// Receives render projections after every reset and step.
#[cfg(feature = "sync-send")]
pub trait RenderSink<T: Config>: Send + Sync {
    /// Presents a render projection.
    fn present(&mut self, rendered: &Rendered<T::Render>);
}

/// Receives render projections after every reset and step.
#[cfg(not(feature = "sync-send"))]
pub trait RenderSink<T: Config> {
    /// Presents a render projection.
    fn present(&mut self, rendered: &Rendered<T::Render>);
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn frame_null_is_not_valid() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
    }

    #[test]
    fn frame_arithmetic() {
        let mut frame = Frame::new(9);
        frame += 1;
        assert_eq!(frame, 10);
        assert_eq!(frame.next(), Frame::new(11));
        assert_eq!(frame - Frame::new(4), 6);
        assert_eq!(frame % 5, 0);
    }

    #[test]
    fn peer_ids_order_lexicographically() {
        let mut joint: JointAction<u8> = BTreeMap::new();
        joint.insert(PeerId::from("p2"), 1);
        joint.insert(PeerId::from("p1"), 0);
        let keys: Vec<&str> = joint.keys().map(PeerId::as_str).collect();
        assert_eq!(keys, vec!["p1", "p2"]);
        assert_eq!(joint.get("p2"), Some(&1));
    }

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let bytes = network::codec::encode(&PeerId::from("abc")).unwrap();
        let plain = network::codec::encode(&"abc").unwrap();
        assert_eq!(bytes, plain);
    }
}
