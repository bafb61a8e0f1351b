//! Builder for [`LockstepSession`](crate::LockstepSession).

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info};
use web_time::Duration;

use crate::runner::DeterministicEnvironmentRunner;
use crate::sessions::barrier::ActionBarrier;
use crate::sessions::config::{SessionConfig, VerificationMode, MIN_EVENT_QUEUE_SIZE};
use crate::sessions::episode_log::EpisodeDataLogger;
use crate::sessions::host::HostCoordinator;
use crate::sessions::resync::ResyncManager;
use crate::sessions::verifier::StateVerifier;
use crate::telemetry::ViolationObserver;
use crate::{
    Config, Environment, EnvironmentError, LockstepError, LockstepSession, PeerId, RelaySocket,
    RenderSink, SessionId,
};

/// Default session id, used when none is set.
const DEFAULT_SESSION_ID: &str = "default";

/// The [`SessionBuilder`] builds a [`LockstepSession`].
///
/// Set the local peer and the expected peers, adjust whatever else needs adjusting, then
/// consume the builder with [`start_session`](Self::start_session).
///
/// ```
/// use lockstep_sync::{Config, SessionBuilder, VerificationMode};
///
/// # struct MyConfig;
/// # impl Config for MyConfig {
/// #     type Action = u8;
/// #     type EnvState = Vec<u8>;
/// #     type Render = ();
/// # }
/// let builder = SessionBuilder::<MyConfig>::new()
///     .with_session_id("game-7")
///     .with_local_peer("p1")
///     .with_expected_peers(["p1", "p2"])
///     .with_num_episodes(3)?
///     .with_verification(VerificationMode::Every { interval: 10 })?;
/// # Ok::<(), lockstep_sync::LockstepError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling start_session"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    session_id: SessionId,
    local_peer: Option<PeerId>,
    expected_peers: Vec<PeerId>,
    config: SessionConfig,
    scene_id: Option<String>,
    subject_id: Option<String>,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    render_sink: Option<Box<dyn RenderSink<T>>>,
}

impl<T: Config> std::fmt::Debug for SessionBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure so a new field cannot be forgotten here.
        let Self {
            session_id,
            local_peer,
            expected_peers,
            config,
            scene_id,
            subject_id,
            violation_observer,
            render_sink,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("session_id", session_id)
            .field("local_peer", local_peer)
            .field("expected_peers", expected_peers)
            .field("config", config)
            .field("scene_id", scene_id)
            .field("subject_id", subject_id)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("has_render_sink", &render_sink.is_some())
            .finish()
    }
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            session_id: SessionId::from(DEFAULT_SESSION_ID),
            local_peer: None,
            expected_peers: Vec::new(),
            config: SessionConfig::default(),
            scene_id: None,
            subject_id: None,
            violation_observer: None,
            render_sink: None,
        }
    }

    /// Sets the id every outbound message is tagged with.
    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Sets the local peer. Required.
    pub fn with_local_peer(mut self, peer: impl Into<PeerId>) -> Self {
        self.local_peer = Some(peer.into());
        self
    }

    /// Sets the peers whose actions make up a joint action, the local peer included.
    /// Required. The relay may later replace the set with its `GameReady` list.
    pub fn with_expected_peers<P: Into<PeerId>>(
        mut self,
        peers: impl IntoIterator<Item = P>,
    ) -> Self {
        self.expected_peers = peers.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the whole [`SessionConfig`]. Validated in [`start_session`](Self::start_session).
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of episodes to play. Default is 1.
    ///
    /// # Errors
    /// - Returns [`LockstepError::InvalidConfig`] if `num_episodes` is 0.
    pub fn with_num_episodes(mut self, num_episodes: u32) -> Result<Self, LockstepError> {
        if num_episodes == 0 {
            return Err(LockstepError::InvalidConfig {
                info: "num_episodes must be at least 1".to_owned(),
            });
        }
        self.config.num_episodes = num_episodes;
        Ok(self)
    }

    /// Sets the self-initiated verification cadence. Default is [`VerificationMode::Off`].
    ///
    /// # Errors
    /// - Returns [`LockstepError::InvalidConfig`] for an interval of 0.
    pub fn with_verification(mut self, mode: VerificationMode) -> Result<Self, LockstepError> {
        if let VerificationMode::Every { interval: 0 } = mode {
            return Err(LockstepError::InvalidConfig {
                info: "verification interval must be at least 1".to_owned(),
            });
        }
        self.config.verification = mode;
        Ok(self)
    }

    /// Sets how long to wait for a joint action before warning about a stall. Default is 5s.
    pub fn with_stall_warning_after(mut self, after: Duration) -> Self {
        self.config.stall_warning_after = after;
        self
    }

    /// Sets the maximum number of events kept before the oldest are dropped. Default is 100.
    ///
    /// # Errors
    /// - Returns [`LockstepError::InvalidConfig`] if `size` is below 10.
    pub fn with_event_queue_size(mut self, size: usize) -> Result<Self, LockstepError> {
        if size < MIN_EVENT_QUEUE_SIZE {
            return Err(LockstepError::InvalidConfig {
                info: format!(
                    "event_queue_size must be at least {}, got {}",
                    MIN_EVENT_QUEUE_SIZE, size
                ),
            });
        }
        self.config.event_queue_size = size;
        Ok(self)
    }

    /// Sets the scene and subject ids sent along with every episode flush.
    pub fn with_episode_metadata(
        mut self,
        scene_id: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        self.scene_id = Some(scene_id.into());
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// Stale joint actions, misrouted snapshots and similar anomalies are reported to it.
    /// If no observer is set, violations are logged via the `tracing` crate.
    ///
    /// ```
    /// use lockstep_sync::{SessionBuilder, Config, telemetry::CollectingObserver};
    /// use std::sync::Arc;
    ///
    /// # struct MyConfig;
    /// # impl Config for MyConfig {
    /// #     type Action = u8;
    /// #     type EnvState = ();
    /// #     type Render = ();
    /// # }
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::<MyConfig>::new()
    ///     .with_violation_observer(observer.clone());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Sets where render projections go after every reset, step and applied snapshot.
    pub fn with_render_sink(mut self, sink: impl RenderSink<T> + 'static) -> Self {
        self.render_sink = Some(Box::new(sink));
        self
    }

    /// Consumes the builder, creates the environment and returns the session.
    ///
    /// The session starts [`Initializing`](crate::SessionState::Initializing) and waits for
    /// the relay's `HostElected`.
    ///
    /// # Errors
    /// - Returns [`LockstepError::InvalidConfig`] if the configuration is invalid, the local
    ///   peer is not set, or the expected peers are empty, duplicated or miss the local peer.
    /// - Returns [`LockstepError::InitializationFailed`] if `env_factory` fails. This is not
    ///   retried.
    pub fn start_session<E, F>(
        self,
        socket: impl RelaySocket<T::Action, T::EnvState> + 'static,
        env_factory: F,
    ) -> Result<LockstepSession<T>, LockstepError>
    where
        E: Environment<T> + 'static,
        F: FnOnce() -> Result<E, EnvironmentError>,
    {
        self.config.validate()?;
        let Some(local) = self.local_peer else {
            return Err(LockstepError::InvalidConfig {
                info: "local peer is not set".to_owned(),
            });
        };
        if self.expected_peers.is_empty() {
            return Err(LockstepError::InvalidConfig {
                info: "no expected peers".to_owned(),
            });
        }
        let unique: BTreeSet<&PeerId> = self.expected_peers.iter().collect();
        if unique.len() != self.expected_peers.len() {
            return Err(LockstepError::InvalidConfig {
                info: format!("duplicate expected peers in {:?}", self.expected_peers),
            });
        }
        if !self.expected_peers.contains(&local) {
            return Err(LockstepError::InvalidConfig {
                info: format!("local peer {} is not an expected peer", local),
            });
        }

        let env = env_factory().map_err(|err| {
            error!(%err, "environment could not be created");
            LockstepError::InitializationFailed {
                context: err.to_string(),
            }
        })?;

        let observer = self.violation_observer;
        let runner = DeterministicEnvironmentRunner::new(
            Box::new(env),
            self.expected_peers.iter().cloned(),
            self.config.num_episodes,
        );
        let host = HostCoordinator::new(local.clone(), observer.clone());
        let barrier = ActionBarrier::new(
            self.session_id.clone(),
            local.clone(),
            self.expected_peers.iter().cloned(),
            self.config.stall_warning_after,
            observer.clone(),
        );
        let verifier = StateVerifier::new(
            self.session_id.clone(),
            local.clone(),
            self.config.verification,
            observer.clone(),
        );
        let resync = ResyncManager::new(self.session_id.clone(), observer.clone());
        let logger = EpisodeDataLogger::new(
            self.session_id.clone(),
            local.clone(),
            self.scene_id,
            self.subject_id,
            observer,
        );

        info!(
            session = %self.session_id,
            local = %local,
            peers = ?self.expected_peers,
            episodes = self.config.num_episodes,
            "session started"
        );
        Ok(LockstepSession::new(
            self.session_id,
            local,
            Box::new(socket),
            runner,
            host,
            barrier,
            verifier,
            resync,
            logger,
            self.render_sink,
            self.config.event_queue_size,
        ))
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
    use super::*;
    use crate::observation::{EnvReset, EnvStep};
    use crate::rng::Pcg32;
    use crate::{InboundMessage, JointAction, OutboundMessage, SessionState};

    struct NullConfig;

    impl Config for NullConfig {
        type Action = u8;
        type EnvState = ();
        type Render = ();
    }

    struct NullSocket;

    impl RelaySocket<u8, ()> for NullSocket {
        fn send(&mut self, _msg: &OutboundMessage<u8, ()>) {}

        fn receive_all_messages(&mut self) -> Vec<InboundMessage<u8, ()>> {
            Vec::new()
        }
    }

    struct NullEnv;

    impl Environment<NullConfig> for NullEnv {
        fn reset(&mut self, _seed: u64, _rng: &mut Pcg32) -> Result<EnvReset, EnvironmentError> {
            Err(EnvironmentError::new("unused"))
        }

        fn step(
            &mut self,
            _joint_action: &JointAction<u8>,
            _rng: &mut Pcg32,
        ) -> Result<EnvStep, EnvironmentError> {
            Err(EnvironmentError::new("unused"))
        }

        fn render(&self) {}

        fn save_state(&self) -> Result<(), EnvironmentError> {
            Ok(())
        }

        fn load_state(&mut self, _state: &()) -> Result<(), EnvironmentError> {
            Ok(())
        }
    }

    fn builder() -> SessionBuilder<NullConfig> {
        SessionBuilder::new()
            .with_local_peer("p1")
            .with_expected_peers(["p1", "p2"])
    }

    #[test]
    fn starts_initializing() {
        let session = builder().start_session(NullSocket, || Ok(NullEnv)).unwrap();
        assert_eq!(session.current_state(), SessionState::Initializing);
        assert_eq!(session.session_id().as_str(), DEFAULT_SESSION_ID);
    }

    #[test]
    fn factory_failure_is_initialization_failure() {
        let err = builder()
            .start_session(NullSocket, || -> Result<NullEnv, _> {
                Err(EnvironmentError::new("no assets"))
            })
            .unwrap_err();
        assert_eq!(
            err,
            LockstepError::InitializationFailed {
                context: "no assets".to_owned()
            }
        );
    }

    #[test]
    fn missing_local_peer_is_rejected() {
        let err = SessionBuilder::<NullConfig>::new()
            .with_expected_peers(["p1"])
            .start_session(NullSocket, || Ok(NullEnv))
            .unwrap_err();
        assert!(matches!(err, LockstepError::InvalidConfig { .. }));
    }

    #[test]
    fn local_peer_must_be_expected() {
        let err = SessionBuilder::<NullConfig>::new()
            .with_local_peer("p3")
            .with_expected_peers(["p1", "p2"])
            .start_session(NullSocket, || Ok(NullEnv))
            .unwrap_err();
        assert!(matches!(err, LockstepError::InvalidConfig { .. }));
    }

    #[test]
    fn duplicate_peers_are_rejected() {
        let err = builder()
            .with_expected_peers(["p1", "p1"])
            .start_session(NullSocket, || Ok(NullEnv))
            .unwrap_err();
        assert!(matches!(err, LockstepError::InvalidConfig { .. }));
    }

    #[test]
    fn setters_validate() {
        assert!(builder().with_num_episodes(0).is_err());
        assert!(builder()
            .with_verification(VerificationMode::Every { interval: 0 })
            .is_err());
        assert!(builder().with_event_queue_size(9).is_err());
        assert!(builder().with_event_queue_size(10).is_ok());
    }

    #[test]
    fn invalid_config_is_caught_at_start() {
        let config = SessionConfig {
            num_episodes: 0,
            ..SessionConfig::default()
        };
        let err = builder()
            .with_config(config)
            .start_session(NullSocket, || Ok(NullEnv))
            .unwrap_err();
        assert!(matches!(err, LockstepError::InvalidConfig { .. }));
    }

    #[test]
    fn debug_hides_observer() {
        let text = format!("{:?}", builder().with_episode_metadata("scene", "subject"));
        assert!(text.contains("has_violation_observer: false"));
        assert!(text.contains("scene"));
    }
}
