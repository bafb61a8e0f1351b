//! Messages exchanged with the relay.
//!
//! The relay only forwards and compares; it never steps the simulation. Each peer sends
//! [`OutboundMessage`]s and receives [`InboundMessage`]s. Both are generic over the action
//! type `A` and the environment state type `S` so the crate never has to guess at the
//! environment's encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checksum::StateDigest;
use crate::frame_info::{FrameRecord, FullSnapshot};
use crate::{Frame, JointAction, PeerId, SessionId};

/// Messages a peer sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutboundMessage<A, S> {
    /// The local peer's action for a frame.
    SubmitLocalAction {
        /// The game session.
        session_id: SessionId,
        /// The submitting peer.
        peer_id: PeerId,
        /// The action.
        action: A,
        /// The frame the action is for.
        frame: Frame,
    },
    /// The local peer's state digest for a frame the relay asked to verify.
    SubmitStateDigest {
        /// The game session.
        session_id: SessionId,
        /// The submitting peer.
        peer_id: PeerId,
        /// The digest of the local state projection.
        digest: StateDigest,
        /// The frame the digest describes.
        frame: Frame,
    },
    /// The host's full state, sent in answer to [`InboundMessage::RequestSnapshot`].
    SnapshotResponse {
        /// The game session.
        session_id: SessionId,
        /// The sealed snapshot.
        snapshot: FullSnapshot<S>,
    },
    /// Episode data accumulated by the host, sent once per completed episode.
    FlushEpisodeData {
        /// The game session.
        session_id: SessionId,
        /// The host.
        peer_id: PeerId,
        /// Zero-based episode index.
        episode: u32,
        /// Scene identifier, if configured.
        scene_id: Option<String>,
        /// Subject identifier, if configured.
        subject_id: Option<String>,
        /// One record per executed frame.
        buffer: Vec<FrameRecord<A>>,
    },
}

impl<A, S> OutboundMessage<A, S> {
    /// Short name of the message kind, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SubmitLocalAction { .. } => "submit_local_action",
            Self::SubmitStateDigest { .. } => "submit_state_digest",
            Self::SnapshotResponse { .. } => "snapshot_response",
            Self::FlushEpisodeData { .. } => "flush_episode_data",
        }
    }
}

/// Messages the relay sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InboundMessage<A, S> {
    /// Roles and the shared seed. Sent once per session.
    HostElected {
        /// Whether the receiving peer is the host.
        is_host: bool,
        /// The host's id. `None` together with `is_host` means the receiver.
        host_id: Option<PeerId>,
        /// The shared seed.
        seed: u64,
    },
    /// The previous host left and another peer took over.
    HostChanged {
        /// The new host.
        new_host_id: PeerId,
    },
    /// All expected peers are connected.
    GameReady {
        /// The participating peers.
        peers: Vec<PeerId>,
    },
    /// Every expected peer has submitted an action for `frame`.
    JointActionReady {
        /// The frame the actions are for.
        frame: Frame,
        /// One action per expected peer.
        joint_action: JointAction<A>,
    },
    /// Compute and submit a state digest for `frame`.
    VerifyState {
        /// The frame to verify.
        frame: Frame,
    },
    /// Digests submitted for `frame` did not match.
    DivergenceDetected {
        /// The frame of the mismatching digests.
        frame: Frame,
    },
    /// Restore the host's state. Only ever sent to non-hosts.
    ApplySnapshot {
        /// The sealed snapshot.
        snapshot: FullSnapshot<S>,
    },
    /// Serve the full state. Only ever sent to the host.
    RequestSnapshot {
        /// The frame of the divergence.
        frame: Frame,
    },
}

impl<A, S> InboundMessage<A, S> {
    /// Short name of the message kind, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HostElected { .. } => "host_elected",
            Self::HostChanged { .. } => "host_changed",
            Self::GameReady { .. } => "game_ready",
            Self::JointActionReady { .. } => "joint_action_ready",
            Self::VerifyState { .. } => "verify_state",
            Self::DivergenceDetected { .. } => "divergence_detected",
            Self::ApplySnapshot { .. } => "apply_snapshot",
            Self::RequestSnapshot { .. } => "request_snapshot",
        }
    }
}

/// Builds a joint action from `(peer, action)` pairs.
///
/// ```
/// use lockstep_sync::network::messages::joint_action;
///
/// let joint = joint_action([("p2", 1u8), ("p1", 0u8)]);
/// assert_eq!(joint.keys().next().map(|p| p.as_str()), Some("p1"));
/// ```
pub fn joint_action<A, P, I>(pairs: I) -> JointAction<A>
where
    P: Into<PeerId>,
    I: IntoIterator<Item = (P, A)>,
{
    pairs
        .into_iter()
        .map(|(peer, action)| (peer.into(), action))
        .collect::<BTreeMap<_, _>>()
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
    use crate::network::codec::{decode_value, encode};

    type Outbound = OutboundMessage<u8, Vec<u8>>;
    type Inbound = InboundMessage<u8, Vec<u8>>;

    #[test]
    fn outbound_action_survives_the_wire() {
        let msg: Outbound = OutboundMessage::SubmitLocalAction {
            session_id: SessionId::from("game-1"),
            peer_id: PeerId::from("p1"),
            action: 3,
            frame: Frame::new(12),
        };
        let decoded: Outbound = decode_value(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "submit_local_action");
    }

    #[test]
    fn election_without_host_id_decodes() {
        let msg: Inbound = InboundMessage::HostElected {
            is_host: true,
            host_id: None,
            seed: 42,
        };
        let decoded: Inbound = decode_value(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn joint_action_helper_sorts_peers() {
        let joint = joint_action([("p2", 1u8), ("p1", 0u8)]);
        let order: Vec<(&str, u8)> = joint.iter().map(|(p, a)| (p.as_str(), *a)).collect();
        assert_eq!(order, vec![("p1", 0), ("p2", 1)]);
    }

    #[test]
    fn kinds_are_distinct() {
        let kinds = [
            Inbound::GameReady { peers: Vec::new() }.kind(),
            Inbound::VerifyState {
                frame: Frame::new(0),
            }
            .kind(),
            Inbound::DivergenceDetected {
                frame: Frame::new(0),
            }
            .kind(),
            Inbound::RequestSnapshot {
                frame: Frame::new(0),
            }
            .kind(),
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
