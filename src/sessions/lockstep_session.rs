//! The lockstep session.
//!
//! [`LockstepSession`] wires the host coordinator, action barrier, runner, verifier,
//! resync manager and episode logger to one [`RelaySocket`](crate::RelaySocket).
//! Inbound relay messages are dispatched in [`LockstepSession::poll_remote_clients`];
//! [`LockstepSession::step`] advances at most one frame and never blocks.

use std::collections::{BTreeMap, VecDeque};
use std::task::Poll;

use tracing::{debug, error, info, trace, warn};

use crate::frame_info::{FrameRecord, Rendered, StepOutcome};
use crate::network::messages::{InboundMessage, OutboundMessage};
use crate::runner::DeterministicEnvironmentRunner;
use crate::sessions::barrier::ActionBarrier;
use crate::sessions::episode_log::EpisodeDataLogger;
use crate::sessions::event_drain::EventDrain;
use crate::sessions::host::{HostCoordinator, Role, RoleChange};
use crate::sessions::resync::{ApplyOutcome, ResyncManager, ResyncState};
use crate::sessions::verifier::StateVerifier;
use crate::{
    Config, Frame, FullSnapshot, JointAction, LockstepError, LockstepEvent, PeerId, Policy,
    RelaySocket, RenderSink, SessionId, SessionState, StateDigest,
};

/// What a call to [`LockstepSession::step`] achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum StepProgress<R> {
    /// A divergence is being resolved; nothing was submitted.
    Paused,
    /// The local action is submitted and the joint action for `frame` has not arrived yet.
    /// Call [`LockstepSession::poll_remote_clients`] and step again.
    AwaitingJointAction {
        /// The frame being waited for.
        frame: Frame,
    },
    /// One frame was executed.
    Stepped(StepOutcome<R>),
    /// All configured episodes have completed.
    Done,
}

/// A lockstep session is one peer's view of a shared deterministic simulation.
///
/// The session owns the relay socket and the environment runner, dispatches every inbound
/// message to the component responsible for it, and advances the simulation only when the
/// relay has announced the complete joint action for the current frame.
pub struct LockstepSession<T>
where
    T: Config,
{
    session_id: SessionId,
    local: PeerId,
    socket: Box<dyn RelaySocket<T::Action, T::EnvState>>,
    runner: DeterministicEnvironmentRunner<T>,
    host: HostCoordinator,
    barrier: ActionBarrier<T::Action>,
    verifier: StateVerifier,
    resync: ResyncManager,
    logger: EpisodeDataLogger<T::Action>,
    render_sink: Option<Box<dyn RenderSink<T>>>,
    /// The peers announced by the relay, once it has sent `GameReady`.
    peers: Option<Vec<PeerId>>,
    failure: Option<LockstepError>,

    event_queue: VecDeque<LockstepEvent>,
    max_event_queue_size: usize,
}

impl<T: Config> std::fmt::Debug for LockstepSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockstepSession")
            .field("session_id", &self.session_id)
            .field("local", &self.local)
            .field("state", &self.current_state())
            .field("runner", &self.runner)
            .field("host", &self.host)
            .field("barrier", &self.barrier)
            .field("verifier", &self.verifier)
            .field("resync", &self.resync)
            .field("logger", &self.logger)
            .field("peers", &self.peers)
            .field("failure", &self.failure)
            .field("queued_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl<T: Config> LockstepSession<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        local: PeerId,
        socket: Box<dyn RelaySocket<T::Action, T::EnvState>>,
        runner: DeterministicEnvironmentRunner<T>,
        host: HostCoordinator,
        barrier: ActionBarrier<T::Action>,
        verifier: StateVerifier,
        resync: ResyncManager,
        logger: EpisodeDataLogger<T::Action>,
        render_sink: Option<Box<dyn RenderSink<T>>>,
        max_event_queue_size: usize,
    ) -> Self {
        Self {
            session_id,
            local,
            socket,
            runner,
            host,
            barrier,
            verifier,
            resync,
            logger,
            render_sink,
            peers: None,
            failure: None,
            event_queue: VecDeque::new(),
            max_event_queue_size,
        }
    }

    /// Receives everything the relay sent since the last call and handles it.
    ///
    /// Call this before every [`step`](Self::step). It never blocks.
    pub fn poll_remote_clients(&mut self) {
        let messages = self.socket.receive_all_messages();
        for message in messages {
            trace!(kind = message.kind(), "inbound");
            self.handle_message(message);
        }
        if let Some(waited) = self.barrier.check_stall() {
            self.push_event(LockstepEvent::JointActionStalled {
                frame: self.barrier.awaiting(),
                waited_ms: waited.as_millis(),
            });
        }
    }

    /// Tries to advance the simulation by one frame.
    ///
    /// The local action is submitted once per frame; while the joint action has not
    /// arrived, later calls return [`StepProgress::AwaitingJointAction`] and their
    /// `local_action` is ignored. On the frame that completes an episode, the host flushes
    /// the episode's data and the environment is reset for the next episode right away.
    ///
    /// # Errors
    ///
    /// - [`LockstepError::NotElected`] before the relay assigned roles and the seed.
    /// - [`LockstepError::Environment`] if the environment fails. The session is then
    ///   [`SessionState::Failed`] and every later call returns the same error.
    pub fn step(
        &mut self,
        local_action: T::Action,
    ) -> Result<StepProgress<T::Render>, LockstepError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.runner.is_done() {
            return Ok(StepProgress::Done);
        }
        if !self.resync.is_active() {
            let served = self.host.is_host()
                && matches!(self.resync.state(), ResyncState::Resyncing { .. });
            if !served {
                return Ok(StepProgress::Paused);
            }
            self.resume_after_serving();
        }
        let seed = match (self.host.role(), self.host.seed()) {
            (Role::Unassigned, _) | (_, None) => return Err(LockstepError::NotElected),
            (_, Some(seed)) => seed,
        };
        if self.runner.needs_reset() {
            self.reset_episode(seed)?;
        }

        let frame = self.runner.frame();
        if !self.barrier.has_submitted(frame) {
            let message = self.barrier.submit_local_action(local_action, frame)?;
            self.socket.send(&message);
        }
        let joint_action = match self.barrier.poll_joint_action(frame) {
            Poll::Ready(joint_action) => joint_action,
            Poll::Pending => return Ok(StepProgress::AwaitingJointAction { frame }),
        };

        let outcome = self.guard(|session| session.runner.step(&joint_action))?;
        self.logger.record(
            self.host.should_log(),
            FrameRecord::from_step(&outcome, &joint_action),
        );
        let digest = self.runner.digest()?;
        if let Some(message) = self.verifier.record(self.runner.frame(), digest) {
            self.send_digest(&message);
        }
        self.present(&outcome.render);

        if outcome.episode_complete {
            self.finish_episode(seed)?;
        }
        Ok(StepProgress::Stepped(outcome))
    }

    /// Returns all events that happened since the last call, oldest first.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// Runs `policy` on `agent`'s latest observation with the shared policy generator.
    ///
    /// The policy generator is part of the state digest, so every peer has to make the same
    /// policy calls in the same order.
    pub fn evaluate_policy(
        &mut self,
        policy: &mut dyn Policy<T>,
        agent: &PeerId,
    ) -> Option<T::Action> {
        self.runner.evaluate_policy(policy, agent)
    }

    /// The current state of the session.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        if self.failure.is_some() {
            return SessionState::Failed;
        }
        if self.runner.is_done() {
            return SessionState::Done;
        }
        if self.host.seed().is_none() || matches!(self.host.role(), Role::Unassigned) {
            return SessionState::Initializing;
        }
        match self.resync.state() {
            ResyncState::Paused { .. } => SessionState::Paused,
            ResyncState::Resyncing { .. } => SessionState::Resyncing,
            ResyncState::Active if self.runner.needs_reset() => SessionState::Ready,
            ResyncState::Active => SessionState::Running,
        }
    }

    /// The local peer's role.
    #[must_use]
    pub fn role(&self) -> &Role {
        self.host.role()
    }

    /// Returns `true` if the local peer is the host.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.host.is_host()
    }

    /// Where the local peer stands in the resync cycle.
    #[must_use]
    pub fn resync_state(&self) -> ResyncState {
        self.resync.state()
    }

    /// The frame the next joint action will be executed at.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.runner.frame()
    }

    /// Zero-based index of the current episode.
    #[must_use]
    pub fn episode(&self) -> u32 {
        self.runner.episode()
    }

    /// Cumulative reward per agent in the current episode.
    #[must_use]
    pub fn cumulative_rewards(&self) -> &BTreeMap<PeerId, f64> {
        self.runner.cumulative_rewards()
    }

    /// Digest of the current state.
    ///
    /// # Errors
    ///
    /// [`LockstepError::Serialization`] if the state projection cannot be encoded.
    pub fn digest(&self) -> Result<StateDigest, LockstepError> {
        self.runner.digest()
    }

    /// Read-only access to the runner, for UI code.
    #[must_use]
    pub fn runner(&self) -> &DeterministicEnvironmentRunner<T> {
        &self.runner
    }

    /// The current render projection.
    #[must_use]
    pub fn rendered(&self) -> Rendered<T::Render> {
        self.runner.rendered()
    }

    /// The local peer.
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// The game session id.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The peers every joint action must cover.
    #[must_use]
    pub fn expected_peers(&self) -> &[PeerId] {
        self.runner.expected_peers()
    }

    /// Returns `true` once the relay has announced that every peer is connected.
    #[must_use]
    pub fn is_game_ready(&self) -> bool {
        self.peers.is_some()
    }

    /// Number of frame records the host has buffered for the current episode.
    #[must_use]
    pub fn buffered_records(&self) -> usize {
        self.logger.len()
    }

    fn handle_message(&mut self, message: InboundMessage<T::Action, T::EnvState>) {
        match message {
            InboundMessage::HostElected {
                is_host,
                host_id,
                seed,
            } => {
                let change = self.host.on_elected(is_host, host_id, seed);
                self.on_role_change(change);
            },
            InboundMessage::HostChanged { new_host_id } => {
                let change = self.host.on_host_changed(new_host_id);
                self.on_role_change(change);
            },
            InboundMessage::GameReady { peers } => self.on_game_ready(peers),
            InboundMessage::JointActionReady {
                frame,
                joint_action,
            } => self.on_joint_action_ready(frame, joint_action),
            InboundMessage::VerifyState { frame } => {
                let step_outstanding =
                    frame.as_i32() > 0 && self.barrier.is_announced(Frame::new(frame.as_i32() - 1));
                if let Some(message) = self.verifier.on_verification_requested(
                    frame,
                    self.runner.frame(),
                    step_outstanding,
                ) {
                    self.send_digest(&message);
                }
            },
            InboundMessage::DivergenceDetected { frame } => {
                if self.resync.on_divergence(frame) {
                    self.suspend();
                    self.push_event(LockstepEvent::DivergenceDetected { frame });
                }
            },
            InboundMessage::RequestSnapshot { frame } => self.on_snapshot_requested(frame),
            InboundMessage::ApplySnapshot { snapshot } => self.on_apply_snapshot(&snapshot),
        }
    }

    fn on_role_change(&mut self, change: RoleChange) {
        match change {
            RoleChange::Unchanged => {},
            RoleChange::Elected => {
                if let (Some(host), Some(seed)) = (self.host.host_id().cloned(), self.host.seed())
                {
                    self.push_event(LockstepEvent::HostElected {
                        host,
                        is_host: self.host.is_host(),
                        seed,
                    });
                }
            },
            RoleChange::Promoted => {
                self.resync.abandon();
                self.push_event(LockstepEvent::Promoted {
                    frame: self.runner.frame(),
                });
            },
            RoleChange::Demoted => {
                self.logger.discard();
                self.resync.abandon();
                if let Some(new_host) = self.host.host_id().cloned() {
                    self.push_event(LockstepEvent::Demoted { new_host });
                }
            },
            RoleChange::HostChanged => {
                self.resync.abandon();
                if let Some(new_host) = self.host.host_id().cloned() {
                    self.push_event(LockstepEvent::HostChanged { new_host });
                }
            },
        }
    }

    fn on_game_ready(&mut self, peers: Vec<PeerId>) {
        if peers.is_empty() {
            warn!("relay announced an empty peer list; keeping the configured peers");
        } else {
            if !peers.contains(&self.local) {
                warn!(peers = ?peers, local = %self.local, "local peer missing from peer list");
            }
            info!(peers = ?peers, "game ready");
            self.barrier.set_expected_peers(peers.iter().cloned());
            self.runner.set_expected_peers(peers.iter().cloned());
            self.peers = Some(peers);
        }
        if self.host.is_host() && self.resync.resume() {
            self.release();
        }
    }

    fn on_joint_action_ready(&mut self, frame: Frame, joint_action: JointAction<T::Action>) {
        if self.host.is_host() && self.resync.resume() {
            self.release();
        }
        if !self.resync.is_active() {
            debug!(%frame, "dropping joint action while paused");
            return;
        }
        self.barrier.on_joint_action_ready(frame, joint_action);
    }

    fn on_snapshot_requested(&mut self, frame: Frame) {
        let was_active = self.resync.is_active();
        let Some(response) =
            self.resync
                .on_snapshot_requested(frame, self.host.is_host(), &self.runner)
        else {
            return;
        };
        if was_active {
            self.suspend();
        }
        if let OutboundMessage::SnapshotResponse { snapshot, .. } = &response {
            self.push_event(LockstepEvent::SnapshotServed {
                frame: snapshot.frame,
            });
        }
        self.socket.send(&response);
    }

    fn on_apply_snapshot(&mut self, snapshot: &FullSnapshot<T::EnvState>) {
        match self
            .resync
            .on_apply_snapshot(snapshot, self.host.is_host(), &mut self.runner)
        {
            ApplyOutcome::Ignored => {},
            ApplyOutcome::Applied { frame } => {
                self.barrier.reset_to(frame);
                self.release();
                match self.runner.digest() {
                    Ok(digest) => self.verifier.remember(frame, digest),
                    Err(err) => error!(%err, "could not digest restored state"),
                }
                let rendered = self.runner.rendered();
                self.present(&rendered);
                self.push_event(LockstepEvent::SnapshotApplied { frame });
            },
            ApplyOutcome::Rejected { frame, reason } => {
                self.suspend();
                self.push_event(LockstepEvent::ResyncFailed { frame, reason });
            },
        }
    }

    fn resume_after_serving(&mut self) {
        if self.resync.resume() {
            self.release();
        }
    }

    /// Stops submission, release and verification, and forgets anything in flight.
    fn suspend(&mut self) {
        self.barrier.clear();
        self.barrier.set_paused(true);
        self.verifier.set_paused(true);
    }

    fn release(&mut self) {
        self.barrier.set_paused(false);
        self.verifier.set_paused(false);
    }

    fn reset_episode(&mut self, seed: u64) -> Result<(), LockstepError> {
        self.barrier.reset_to(Frame::new(0));
        let outcome = self.guard(|session| session.runner.reset(seed))?;
        self.present(&outcome.render);
        self.push_event(LockstepEvent::EpisodeStarted {
            episode: self.runner.episode(),
        });
        Ok(())
    }

    fn finish_episode(&mut self, seed: u64) -> Result<(), LockstepError> {
        let episode = self.runner.episode();
        self.push_event(LockstepEvent::EpisodeCompleted {
            episode,
            cumulative_rewards: self.runner.cumulative_rewards().clone(),
        });
        let flush: Option<OutboundMessage<T::Action, T::EnvState>> =
            self.logger.flush(self.host.should_log(), episode);
        if let Some(message) = flush {
            if let OutboundMessage::FlushEpisodeData { buffer, .. } = &message {
                let records = buffer.len();
                self.socket.send(&message);
                self.push_event(LockstepEvent::EpisodeFlushed { episode, records });
            }
        }
        if self.runner.complete_episode() {
            self.reset_episode(seed)
        } else {
            info!(episodes = self.runner.num_episodes(), "all episodes completed");
            self.push_event(LockstepEvent::SessionDone);
            Ok(())
        }
    }

    /// Runs a runner operation and marks the session failed if the environment broke.
    fn guard<R>(
        &mut self,
        operation: impl FnOnce(&mut Self) -> Result<R, LockstepError>,
    ) -> Result<R, LockstepError> {
        let result = operation(self);
        if let Err(err @ LockstepError::Environment { .. }) = &result {
            error!(%err, "environment failed; session is no longer usable");
            self.failure = Some(err.clone());
        }
        result
    }

    fn send_digest(&mut self, message: &OutboundMessage<T::Action, T::EnvState>) {
        self.socket.send(message);
        if let OutboundMessage::SubmitStateDigest { frame, digest, .. } = message {
            self.push_event(LockstepEvent::DigestSubmitted {
                frame: *frame,
                digest: *digest,
            });
        }
    }

    fn present(&mut self, rendered: &Rendered<T::Render>) {
        if let Some(sink) = self.render_sink.as_mut() {
            sink.present(rendered);
        }
    }

    fn push_event(&mut self, event: LockstepEvent) {
        self.event_queue.push_back(event);
        // keep the queue bounded; oldest events go first
        while self.event_queue.len() > self.max_event_queue_size {
            self.event_queue.pop_front();
        }
    }
}
