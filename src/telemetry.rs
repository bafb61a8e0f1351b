//! Structured reporting of protocol violations.
//!
//! A lockstep peer can observe many things that "should never happen": a joint
//! action for a frame that was already resolved, a snapshot that fails its own
//! digest, a host change that demotes us mid-episode. None of these are fatal,
//! but each is worth recording. Instead of ad-hoc `tracing::warn!` calls,
//! violations are structured data that can be:
//!
//! - Logged via tracing (the default)
//! - Collected programmatically for testing
//! - Forwarded to custom observers
//!
//! # Example
//!
//! ```
//! use lockstep_sync::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // ... hand `observer.clone()` to a SessionBuilder and run the session ...
//! assert!(!observer.has_violation(ViolationKind::ActionBarrier));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serializes `Option<Frame>` as a plain integer, or `null` for `None` and [`Frame::NULL`].
mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            None => serializer.serialize_none(),
            Some(f) if f.is_null() => serializer.serialize_none(),
            Some(f) => serializer.serialize_i32(f.as_i32()),
        }
    }
}

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the session continued.
    Warning,
    /// Serious issue; behavior may be degraded until the next resync.
    Error,
    /// An invariant is broken and local state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of violations, one per protocol component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Host election or promotion went wrong.
    ///
    /// Examples:
    /// - A second `HostElected` that names a different host
    /// - A `HostChanged` naming an unknown peer
    HostRole,
    /// The join-before-advance barrier saw something out of order.
    ///
    /// Examples:
    /// - A joint action for an already-resolved frame
    /// - A joint action missing an expected peer
    ActionBarrier,
    /// State verification failed or could not run.
    ///
    /// Examples:
    /// - The relay reported divergence
    /// - The digest projection could not be serialized
    StateVerification,
    /// Snapshot capture or restore failed.
    ///
    /// Examples:
    /// - Snapshot self-digest mismatch
    /// - Environment rejected a saved state
    Snapshot,
    /// Episode data logging was asked to do something only the host may do.
    EpisodeLog,
    /// The relay sent a message that makes no sense in the current state.
    NetworkProtocol,
    /// Configuration constraint violated.
    Configuration,
    /// Internal logic error. These indicate bugs in the library itself.
    InternalError,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HostRole => "host_role",
            Self::ActionBarrier => "action_barrier",
            Self::StateVerification => "state_verification",
            Self::Snapshot => "snapshot",
            Self::EpisodeLog => "episode_log",
            Self::NetworkProtocol => "network_protocol",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with the context needed to diagnose it.
///
/// # Example
///
/// ```
/// use lockstep_sync::telemetry::{ProtocolViolation, ViolationSeverity, ViolationKind};
/// use lockstep_sync::Frame;
///
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::ActionBarrier,
///     "stale joint action",
///     "barrier.rs:42",
/// ).with_frame(Frame::new(7))
///  .with_context("awaiting", "9");
///
/// assert_eq!(violation.frame, Some(Frame::new(7)));
/// assert!(violation.to_string().contains("action_barrier"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The component where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The frame at which the violation occurred, if applicable.
    #[serde(serialize_with = "frame_serializer::serialize")]
    pub frame: Option<Frame>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the frame at which this violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes this violation to a JSON string.
    ///
    /// Returns `None` if serialization fails.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Serializes this violation to a pretty-printed JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Trait for observing violations.
///
/// When the `sync-send` feature is enabled, observers must be `Send + Sync`.
///
/// # Example
///
/// ```
/// use lockstep_sync::telemetry::{ViolationObserver, ProtocolViolation};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CountingObserver {
///     count: AtomicUsize,
/// }
///
/// impl ViolationObserver for CountingObserver {
///     fn on_violation(&self, _violation: &ProtocolViolation) {
///         self.count.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected. Should return quickly.
    fn on_violation(&self, violation: &ProtocolViolation);
}

#[cfg(not(feature = "sync-send"))]
/// Trait for observing violations.
pub trait ViolationObserver {
    /// Called when a violation is detected. Should return quickly.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Observer that logs violations via `tracing`.
///
/// `Warning` maps to `tracing::warn!`, `Error` and `Critical` to `tracing::error!`.
/// All fields are emitted as structured tracing fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<Frame>) -> String {
        match frame {
            Some(f) if !f.is_null() => f.as_i32().to_string(),
            _ => "null".to_owned(),
        }
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame_str = Self::format_frame(violation.frame);

        let context_str = if violation.context.is_empty() {
            "{}".to_owned()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Observer that collects violations so tests can assert on them.
///
/// # Example
///
/// ```
/// use lockstep_sync::telemetry::{CollectingObserver, ViolationKind, ViolationObserver, ProtocolViolation, ViolationSeverity};
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::HostRole,
///     "unexpected re-election",
///     "host.rs:1",
/// ));
///
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::HostRole));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns true if no violations have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Checks if any violation of the specified kind has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns all violations matching the specified kind.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns all violations at or above the specified severity.
    #[must_use]
    pub fn violations_at_severity(&self, min_severity: ViolationSeverity) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Clears all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards violations to several observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Creates a composite observer with no children.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Adds an observer to the composite.
    pub fn add(&mut self, observer: Arc<dyn ViolationObserver>) {
        self.observers.push(observer);
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        for observer in &self.observers {
            observer.on_violation(violation);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("num_observers", &self.observers.len())
            .finish()
    }
}

/// Reports a violation with the current file and line to the [`TracingObserver`].
///
/// ```
/// use lockstep_sync::{report_violation, telemetry::{ViolationSeverity, ViolationKind}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::ActionBarrier,
///     "joint action for frame {} arrived after frame {}", 3, 5);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Asserts that an observer collected no violations.
///
/// # Panics
///
/// Panics if the observer contains any violations, printing them for debugging.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a violation of the specified kind was collected.
///
/// # Panics
///
/// Panics if no violation of the specified kind was found.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

/// Reports a violation to an optional observer, falling back to [`TracingObserver`].
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through a session's optional observer.
///
/// Like [`report_violation!`], but the first argument is an
/// `Option<Arc<dyn ViolationObserver>>`. `None` falls back to [`TracingObserver`].
///
/// ```
/// use lockstep_sync::{report_violation_to, telemetry::{ViolationSeverity, ViolationKind, CollectingObserver, ViolationObserver}};
/// use std::sync::Arc;
///
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(Arc::new(CollectingObserver::new()));
///
/// report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::HostRole,
///     "host changed to unknown peer {}", "p9");
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
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

    fn violation(severity: ViolationSeverity, kind: ViolationKind) -> ProtocolViolation {
        ProtocolViolation::new(severity, kind, "test", "test.rs:1")
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_frame_and_context() {
        let v = violation(ViolationSeverity::Error, ViolationKind::Snapshot)
            .with_frame(Frame::new(10))
            .with_context("reason", "digest mismatch");
        let text = v.to_string();
        assert!(text.contains("[error/snapshot]"));
        assert!(text.contains("frame=10"));
        assert!(text.contains("digest mismatch"));
    }

    #[test]
    fn collecting_observer_filters() {
        let observer = CollectingObserver::new();
        observer.on_violation(&violation(
            ViolationSeverity::Warning,
            ViolationKind::ActionBarrier,
        ));
        observer.on_violation(&violation(
            ViolationSeverity::Critical,
            ViolationKind::Snapshot,
        ));

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.violations_of_kind(ViolationKind::Snapshot).len(), 1);
        assert_eq!(
            observer
                .violations_at_severity(ViolationSeverity::Error)
                .len(),
            1
        );
        assert_violation!(observer, ViolationKind::ActionBarrier);

        observer.clear();
        assert_no_violations!(observer);
    }

    #[test]
    fn composite_forwards_to_all() {
        let a = Arc::new(CollectingObserver::new());
        let b = Arc::new(CollectingObserver::new());
        let mut composite = CompositeObserver::new();
        composite.add(a.clone());
        composite.add(b.clone());
        composite.on_violation(&violation(
            ViolationSeverity::Warning,
            ViolationKind::HostRole,
        ));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn report_violation_to_uses_observer() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::EpisodeLog,
            "peer {} tried to flush",
            "p2"
        );
        let collected = collector.violations();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].message, "peer p2 tried to flush");
        assert!(collected[0].location.contains("telemetry.rs"));
    }

    #[test]
    fn report_violation_to_none_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Error,
            ViolationKind::InternalError,
            "no observer"
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_uses_snake_case_and_plain_frames() {
        let v = violation(ViolationSeverity::Warning, ViolationKind::StateVerification)
            .with_frame(Frame::new(42));
        let json = v.to_json().unwrap();
        assert!(json.contains(r#""severity":"warning""#));
        assert!(json.contains(r#""kind":"state_verification""#));
        assert!(json.contains(r#""frame":42"#));

        let null_frame = violation(ViolationSeverity::Warning, ViolationKind::Snapshot)
            .with_frame(Frame::NULL);
        assert!(null_frame.to_json().unwrap().contains(r#""frame":null"#));
    }

    #[cfg(feature = "json")]
    #[test]
    fn pretty_json_spans_lines() {
        let v = violation(ViolationSeverity::Error, ViolationKind::Snapshot)
            .with_frame(Frame::new(7))
            .with_context("peer", "p2");
        let pretty = v.to_json_pretty().unwrap();
        assert!(pretty.lines().count() > 1);
        assert!(pretty.contains(r#""kind": "snapshot""#));
        assert!(pretty.contains(r#""frame": 7"#));
        assert!(pretty.contains(r#""peer": "p2""#));
    }
}
