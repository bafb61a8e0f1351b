//! Host election and promotion.
//!
//! Exactly one peer is host at a time. The host is the only peer that logs episode data
//! and the only peer that serves snapshots. The relay decides who the host is; this
//! module only tracks what the relay said and reports anything inconsistent.

use std::sync::Arc;

use tracing::{debug, info};

use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::PeerId;

/// The local peer's role in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// No usable election has been received. Treated as non-host.
    Unassigned,
    /// The local peer is the host.
    Host,
    /// Another peer is the host.
    Peer {
        /// The current host.
        host: PeerId,
    },
}

impl Role {
    /// Returns `true` for [`Role::Host`].
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

/// What a role message changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    /// Nothing changed.
    Unchanged,
    /// The first election was applied.
    Elected,
    /// The local peer became host.
    Promoted,
    /// The local peer stopped being host.
    Demoted,
    /// A different remote peer became host.
    HostChanged,
}

/// Tracks the host role and the shared seed.
pub struct HostCoordinator {
    local: PeerId,
    role: Role,
    seed: Option<u64>,
    should_log: bool,
    promotions: u32,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for HostCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCoordinator")
            .field("local", &self.local)
            .field("role", &self.role)
            .field("seed", &self.seed)
            .field("should_log", &self.should_log)
            .field("promotions", &self.promotions)
            .finish_non_exhaustive()
    }
}

impl HostCoordinator {
    /// Creates an unassigned coordinator for the local peer.
    #[must_use]
    pub fn new(local: PeerId, violation_observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        Self {
            local,
            role: Role::Unassigned,
            seed: None,
            should_log: false,
            promotions: 0,
            violation_observer,
        }
    }

    /// Applies a `HostElected` message.
    ///
    /// The first election sets the role and the shared seed. A later election that makes
    /// the local peer host is a promotion. The seed is never replaced once set.
    pub fn on_elected(&mut self, is_host: bool, host_id: Option<PeerId>, seed: u64) -> RoleChange {
        match self.seed {
            None => self.seed = Some(seed),
            Some(current) if current != seed => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::HostRole,
                    "re-election carried seed {} but the session seed is {}; keeping {}",
                    seed,
                    current,
                    current
                );
            },
            Some(_) => {},
        }
        let first = self.role == Role::Unassigned;

        if is_host {
            if let Some(host) = host_id.as_ref().filter(|h| **h != self.local) {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::HostRole,
                    "election marks us as host but names {} as host id",
                    host
                );
            }
            if first {
                self.become_host();
                info!(peer = %self.local, "elected as host");
                return RoleChange::Elected;
            }
            return self.promote();
        }

        match host_id {
            Some(host) if host == self.local => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::HostRole,
                    "election names us as host id but is_host is false"
                );
                RoleChange::Unchanged
            },
            Some(host) => {
                if first {
                    info!(peer = %self.local, host = %host, "joined as peer");
                    self.role = Role::Peer { host };
                    RoleChange::Elected
                } else {
                    self.on_host_changed(host)
                }
            },
            None => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::HostRole,
                    "non-host election without a host id; role stays unassigned"
                );
                RoleChange::Unchanged
            },
        }
    }

    /// Applies a `HostChanged` message.
    pub fn on_host_changed(&mut self, new_host: PeerId) -> RoleChange {
        if new_host == self.local {
            return self.promote();
        }
        match &self.role {
            Role::Peer { host } if *host == new_host => RoleChange::Unchanged,
            Role::Host => {
                info!(peer = %self.local, new_host = %new_host, "demoted");
                self.role = Role::Peer { host: new_host };
                self.should_log = false;
                RoleChange::Demoted
            },
            _ => {
                debug!(peer = %self.local, new_host = %new_host, "host changed");
                self.role = Role::Peer { host: new_host };
                RoleChange::HostChanged
            },
        }
    }

    fn promote(&mut self) -> RoleChange {
        if self.role.is_host() {
            return RoleChange::Unchanged;
        }
        self.become_host();
        self.promotions += 1;
        info!(peer = %self.local, promotions = self.promotions, "promoted to host");
        RoleChange::Promoted
    }

    fn become_host(&mut self) {
        self.role = Role::Host;
        self.should_log = true;
    }

    /// The local peer's role.
    #[must_use]
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Returns `true` if the local peer is the host.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.role.is_host()
    }

    /// Returns `true` if the local peer should log episode data.
    #[must_use]
    pub fn should_log(&self) -> bool {
        self.should_log
    }

    /// The current host, if known.
    #[must_use]
    pub fn host_id(&self) -> Option<&PeerId> {
        match &self.role {
            Role::Unassigned => None,
            Role::Host => Some(&self.local),
            Role::Peer { host } => Some(host),
        }
    }

    /// The shared seed, once elected.
    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// How many times the local peer has been promoted.
    #[must_use]
    pub fn promotions(&self) -> u32 {
        self.promotions
    }

    /// The local peer's id.
    #[must_use]
    pub fn local(&self) -> &PeerId {
        &self.local
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
    use crate::telemetry::CollectingObserver;

    fn coordinator(local: &str) -> (HostCoordinator, Arc<CollectingObserver>) {
        let observer = Arc::new(CollectingObserver::new());
        let coordinator = HostCoordinator::new(PeerId::from(local), Some(observer.clone()));
        (coordinator, observer)
    }

    #[test]
    fn starts_unassigned_and_non_logging() {
        let (host, _) = coordinator("p1");
        assert_eq!(host.role(), &Role::Unassigned);
        assert!(!host.is_host());
        assert!(!host.should_log());
        assert_eq!(host.seed(), None);
        assert_eq!(host.host_id(), None);
    }

    #[test]
    fn elected_host_logs() {
        let (mut host, observer) = coordinator("p1");
        assert_eq!(host.on_elected(true, None, 42), RoleChange::Elected);
        assert!(host.is_host());
        assert!(host.should_log());
        assert_eq!(host.seed(), Some(42));
        assert_eq!(host.host_id(), Some(&PeerId::from("p1")));
        assert!(observer.is_empty());
    }

    #[test]
    fn elected_peer_does_not_log() {
        let (mut peer, _) = coordinator("p2");
        assert_eq!(
            peer.on_elected(false, Some(PeerId::from("p1")), 42),
            RoleChange::Elected
        );
        assert_eq!(
            peer.role(),
            &Role::Peer {
                host: PeerId::from("p1")
            }
        );
        assert!(!peer.should_log());
    }

    #[test]
    fn promotion_via_host_changed_is_idempotent() {
        let (mut peer, _) = coordinator("p2");
        peer.on_elected(false, Some(PeerId::from("p1")), 7);
        assert_eq!(peer.on_host_changed(PeerId::from("p2")), RoleChange::Promoted);
        assert_eq!(peer.on_host_changed(PeerId::from("p2")), RoleChange::Unchanged);
        assert!(peer.should_log());
        assert_eq!(peer.promotions(), 1);
    }

    #[test]
    fn promotion_via_second_election_keeps_seed() {
        let (mut peer, observer) = coordinator("p2");
        peer.on_elected(false, Some(PeerId::from("p1")), 7);
        assert_eq!(peer.on_elected(true, None, 7), RoleChange::Promoted);
        assert!(peer.is_host());
        assert_eq!(peer.seed(), Some(7));
        assert!(observer.is_empty());
    }

    #[test]
    fn conflicting_seed_is_reported_and_ignored() {
        let (mut peer, observer) = coordinator("p2");
        peer.on_elected(false, Some(PeerId::from("p1")), 7);
        peer.on_elected(true, None, 8);
        assert_eq!(peer.seed(), Some(7));
        assert!(observer.has_violation(ViolationKind::HostRole));
    }

    #[test]
    fn demotion_stops_logging() {
        let (mut host, _) = coordinator("p1");
        host.on_elected(true, None, 1);
        assert_eq!(host.on_host_changed(PeerId::from("p3")), RoleChange::Demoted);
        assert!(!host.is_host());
        assert!(!host.should_log());
        assert_eq!(host.host_id(), Some(&PeerId::from("p3")));
    }

    #[test]
    fn host_changed_between_remotes() {
        let (mut peer, _) = coordinator("p3");
        peer.on_elected(false, Some(PeerId::from("p1")), 1);
        assert_eq!(
            peer.on_host_changed(PeerId::from("p2")),
            RoleChange::HostChanged
        );
        assert_eq!(peer.on_host_changed(PeerId::from("p2")), RoleChange::Unchanged);
    }

    #[test]
    fn non_host_election_without_host_id_is_reported() {
        let (mut peer, observer) = coordinator("p2");
        assert_eq!(peer.on_elected(false, None, 3), RoleChange::Unchanged);
        assert_eq!(peer.role(), &Role::Unassigned);
        assert_eq!(peer.seed(), Some(3));
        assert!(observer.has_violation(ViolationKind::HostRole));
    }
}
