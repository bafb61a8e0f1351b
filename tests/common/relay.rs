//! An in-process relay for driving several sessions in one test.
//!
//! The relay never steps the simulation. It elects the host, collects one action per peer
//! and frame, announces the joint action, asks every peer for its digest after each
//! announcement and compares the answers. On a mismatch it tells everyone about the
//! divergence and asks the host for a snapshot, which it forwards to the other peers.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use lockstep_sync::{
    Frame, InboundMessage, JointAction, OutboundMessage, PeerId, RelaySocket, StateDigest,
};
use parking_lot::Mutex;

struct Mailbox<A, S> {
    to_relay: VecDeque<OutboundMessage<A, S>>,
    to_peer: VecDeque<InboundMessage<A, S>>,
}

impl<A, S> Default for Mailbox<A, S> {
    fn default() -> Self {
        Self {
            to_relay: VecDeque::new(),
            to_peer: VecDeque::new(),
        }
    }
}

type SharedMailbox<A, S> = Arc<Mutex<Mailbox<A, S>>>;

/// One peer's end of the connection to a [`Relay`].
pub struct RelayLink<A, S> {
    mailbox: SharedMailbox<A, S>,
}

impl<A, S> RelaySocket<A, S> for RelayLink<A, S>
where
    A: Clone + Send + Sync,
    S: Clone + Send + Sync,
{
    fn send(&mut self, msg: &OutboundMessage<A, S>) {
        self.mailbox.lock().to_relay.push_back(msg.clone());
    }

    fn receive_all_messages(&mut self) -> Vec<InboundMessage<A, S>> {
        self.mailbox.lock().to_peer.drain(..).collect()
    }
}

/// A flush the relay received.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFlush {
    pub from: PeerId,
    pub episode: u32,
    pub frames: Vec<i32>,
    pub scene_id: Option<String>,
    pub subject_id: Option<String>,
}

pub struct Relay<A, S> {
    seed: u64,
    verify_every_frame: bool,
    peers: Vec<(PeerId, SharedMailbox<A, S>)>,
    host: Option<PeerId>,
    actions: BTreeMap<Frame, JointAction<A>>,
    digests: BTreeMap<Frame, BTreeMap<PeerId, StateDigest>>,
    verification_pending: Option<Frame>,
    last_announced: Option<Frame>,
    flushes: Vec<ReceivedFlush>,
    divergences: Vec<Frame>,
    snapshots_forwarded: usize,
    verified: Vec<Frame>,
}

impl<A, S> Relay<A, S>
where
    A: Clone,
    S: Clone,
{
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            verify_every_frame: true,
            peers: Vec::new(),
            host: None,
            actions: BTreeMap::new(),
            digests: BTreeMap::new(),
            verification_pending: None,
            last_announced: None,
            flushes: Vec::new(),
            divergences: Vec::new(),
            snapshots_forwarded: 0,
            verified: Vec::new(),
        }
    }

    /// Stops asking for digests after every announcement. Digests submitted unasked are
    /// still compared.
    pub fn without_verification(mut self) -> Self {
        self.verify_every_frame = false;
        self
    }

    /// Registers a peer and returns its socket. The first peer to connect becomes host.
    pub fn connect(&mut self, peer: impl Into<PeerId>) -> RelayLink<A, S> {
        let mailbox: SharedMailbox<A, S> = Arc::default();
        self.peers.push((peer.into(), mailbox.clone()));
        RelayLink { mailbox }
    }

    /// Elects the first connected peer and announces the game.
    pub fn start(&mut self) {
        let Some(host) = self.peers.first().map(|(peer, _)| peer.clone()) else {
            return;
        };
        for (peer, _) in self.peers.clone() {
            self.send_to(
                &peer,
                InboundMessage::HostElected {
                    is_host: peer == host,
                    host_id: Some(host.clone()),
                    seed: self.seed,
                },
            );
        }
        self.host = Some(host);
        self.announce_peers();
    }

    /// Queues an arbitrary message for one peer.
    pub fn send_to(&self, peer: &PeerId, msg: InboundMessage<A, S>) {
        if let Some((_, mailbox)) = self.peers.iter().find(|(p, _)| p == peer) {
            mailbox.lock().to_peer.push_back(msg);
        }
    }

    /// Queues a message for every connected peer.
    pub fn broadcast(&self, msg: InboundMessage<A, S>) {
        for (_, mailbox) in &self.peers {
            mailbox.lock().to_peer.push_back(msg.clone());
        }
    }

    /// Handles everything the peers sent since the last call.
    pub fn pump(&mut self) {
        let mut received = Vec::new();
        for (_, mailbox) in &self.peers {
            received.extend(mailbox.lock().to_relay.drain(..));
        }
        for msg in received {
            self.handle(msg);
        }
        self.announce_ready();
    }

    /// Disconnects `peer`. If it was host, the next peer in connection order takes over
    /// and a resync from the new host follows.
    pub fn disconnect(&mut self, peer: &PeerId) {
        self.peers.retain(|(p, _)| p != peer);
        for joint in self.actions.values_mut() {
            joint.remove(peer);
        }
        for submitted in self.digests.values_mut() {
            submitted.remove(peer);
        }
        if self.host.as_ref() != Some(peer) {
            self.announce_peers();
            return;
        }
        let Some(new_host) = self.peers.first().map(|(p, _)| p.clone()) else {
            self.host = None;
            return;
        };
        self.send_to(
            &new_host,
            InboundMessage::HostElected {
                is_host: true,
                host_id: Some(new_host.clone()),
                seed: self.seed,
            },
        );
        for (other, _) in self.peers.clone() {
            if other != new_host {
                self.send_to(
                    &other,
                    InboundMessage::HostChanged {
                        new_host_id: new_host.clone(),
                    },
                );
            }
        }
        self.host = Some(new_host);
        self.announce_peers();
        let frame = self.last_announced.map_or(Frame::new(0), Frame::next);
        self.diverge(frame);
    }

    pub fn host(&self) -> Option<&PeerId> {
        self.host.as_ref()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn flushes(&self) -> &[ReceivedFlush] {
        &self.flushes
    }

    pub fn divergences(&self) -> &[Frame] {
        &self.divergences
    }

    pub fn snapshots_forwarded(&self) -> usize {
        self.snapshots_forwarded
    }

    /// Frames whose digests were compared and agreed.
    pub fn verified(&self) -> &[Frame] {
        &self.verified
    }

    fn handle(&mut self, msg: OutboundMessage<A, S>) {
        match msg {
            OutboundMessage::SubmitLocalAction {
                peer_id,
                action,
                frame,
                ..
            } => {
                if self.is_connected(&peer_id) {
                    self.actions.entry(frame).or_default().insert(peer_id, action);
                }
            },
            OutboundMessage::SubmitStateDigest {
                peer_id,
                digest,
                frame,
                ..
            } => {
                if self.is_connected(&peer_id) {
                    self.digests.entry(frame).or_default().insert(peer_id, digest);
                    self.compare(frame);
                }
            },
            OutboundMessage::SnapshotResponse { snapshot, .. } => {
                for (peer, _) in self.peers.clone() {
                    if Some(&peer) != self.host.as_ref() {
                        self.snapshots_forwarded += 1;
                        self.send_to(
                            &peer,
                            InboundMessage::ApplySnapshot {
                                snapshot: snapshot.clone(),
                            },
                        );
                    }
                }
            },
            OutboundMessage::FlushEpisodeData {
                peer_id,
                episode,
                scene_id,
                subject_id,
                buffer,
                ..
            } => self.flushes.push(ReceivedFlush {
                from: peer_id,
                episode,
                frames: buffer.iter().map(|record| record.frame.as_i32()).collect(),
                scene_id,
                subject_id,
            }),
        }
    }

    fn compare(&mut self, frame: Frame) {
        let Some(submitted) = self.digests.get(&frame) else {
            return;
        };
        if submitted.len() < self.peers.len() {
            return;
        }
        let mut values = submitted.values();
        let first = values.next().copied();
        let agree = values.all(|digest| Some(*digest) == first);
        self.digests.remove(&frame);
        if agree {
            self.verified.push(frame);
            if self.verification_pending == Some(frame) {
                self.verification_pending = None;
            }
        } else {
            self.diverge(frame);
        }
    }

    fn diverge(&mut self, frame: Frame) {
        self.actions.clear();
        self.digests.clear();
        self.verification_pending = None;
        self.divergences.push(frame);
        self.broadcast(InboundMessage::DivergenceDetected { frame });
        if let Some(host) = self.host.clone() {
            self.send_to(&host, InboundMessage::RequestSnapshot { frame });
        }
    }

    fn announce_ready(&mut self) {
        while self.verification_pending.is_none() {
            let expected = self.peers.len();
            let Some(frame) = self
                .actions
                .iter()
                .find(|(_, joint)| joint.len() == expected)
                .map(|(frame, _)| *frame)
            else {
                return;
            };
            let Some(joint_action) = self.actions.remove(&frame) else {
                return;
            };
            self.broadcast(InboundMessage::JointActionReady {
                frame,
                joint_action,
            });
            self.last_announced = Some(frame);
            if self.verify_every_frame {
                let next = frame.next();
                self.broadcast(InboundMessage::VerifyState { frame: next });
                self.verification_pending = Some(next);
            }
        }
    }

    fn announce_peers(&self) {
        self.broadcast(InboundMessage::GameReady {
            peers: self.peers(),
        });
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.iter().any(|(p, _)| p == peer)
    }
}
