//! Per-target circuit breakers.
//!
//! A breaker is a pure state tracker: it never performs I/O and never fails.
//! Callers ask [`CircuitBreaker::can_execute`] before a protected call and
//! report the outcome with [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`].
//!
//! States: CLOSED (normal) -> OPEN (cooling down) -> HALF_OPEN (one probe) -> CLOSED

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Breaker configuration (shared defaults or a per-target override)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Disabled breakers always allow calls and never transition
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures that trip a closed breaker (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before a probe is allowed, in milliseconds (default: 30s)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    /// Cooldown as a duration
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Threshold clamped so a zero in config still requires one failure
    fn effective_threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }
}

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,

    /// Calls are rejected until the cooldown elapses
    Open,

    /// Cooldown elapsed; a single probe call decides the next state
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Read-only snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub target: String,
    pub enabled: bool,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_transition: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    /// When the outstanding half-open probe was handed out
    probe_granted_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    last_transition: DateTime<Utc>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_utc: None,
            probe_granted_at: None,
            total_successes: 0,
            total_failures: 0,
            last_transition: Utc::now(),
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.opened_at_utc = Some(Utc::now());
        self.probe_granted_at = None;
        self.last_transition = Utc::now();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_at_utc = None;
        self.probe_granted_at = None;
        self.last_transition = Utc::now();
    }

    fn cooldown_elapsed(&self, now: Instant, timeout: Duration) -> bool {
        match self.opened_at {
            Some(at) => now.saturating_duration_since(at) >= timeout,
            None => true,
        }
    }
}

/// Circuit breaker guarding a single downstream target
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for a target
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Target this breaker protects
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Configuration in effect
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether a call may proceed now
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    /// Check whether a call may proceed at `now`.
    ///
    /// Once the cooldown has elapsed the breaker hands out exactly one probe
    /// and moves to HALF_OPEN. Further calls are rejected until the probe's
    /// outcome is recorded, or until the probe lease (another full cooldown)
    /// lapses without an outcome.
    pub fn can_execute_at(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        let timeout = self.config.reset_timeout();
        let mut inner = self.lock();
        let state = inner.state;

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !inner.cooldown_elapsed(now, timeout) {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_granted_at = Some(now);
                inner.last_transition = Utc::now();
                info!(breaker = %self.target, "Circuit breaker half-open, allowing probe");
                true
            }
            CircuitState::HalfOpen => {
                let probe = inner.probe_granted_at;
                match probe {
                    Some(at) if now.saturating_duration_since(at) < timeout => false,
                    _ => {
                        debug!(breaker = %self.target, "Probe lease lapsed, granting another probe");
                        inner.probe_granted_at = Some(now);
                        true
                    }
                }
            }
        }
    }

    /// Whether a call would be rejected now, without granting a probe
    pub fn is_blocked(&self) -> bool {
        self.is_blocked_at(Instant::now())
    }

    /// Read-only counterpart of [`CircuitBreaker::can_execute_at`]. Never
    /// transitions state and never hands out the half-open probe.
    pub fn is_blocked_at(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }

        let timeout = self.config.reset_timeout();
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !inner.cooldown_elapsed(now, timeout),
            CircuitState::HalfOpen => matches!(
                inner.probe_granted_at,
                Some(at) if now.saturating_duration_since(at) < timeout
            ),
        }
    }

    /// Record a successful protected call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;

        if !self.config.enabled {
            return;
        }

        if inner.state != CircuitState::Closed {
            info!(breaker = %self.target, from = %inner.state, "Circuit breaker closing");
            inner.close();
        }
    }

    /// Record a failed protected call
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Record a failed protected call observed at `now`
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if !self.config.enabled {
            return;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.effective_threshold() {
                    warn!(
                        breaker = %self.target,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opening due to failures"
                    );
                    inner.open(now);
                }
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                // Restart the cooldown so a flapping target stays isolated
                warn!(
                    breaker = %self.target,
                    from = %inner.state,
                    "Circuit breaker re-opening"
                );
                inner.open(now);
            }
        }
    }

    /// Snapshot of the breaker (no side effects)
    pub fn status(&self) -> BreakerStatus {
        self.status_at(Instant::now())
    }

    /// Snapshot as observed at `now`.
    ///
    /// An OPEN breaker whose cooldown has elapsed reports HALF_OPEN, since
    /// the next call would be admitted as a probe.
    pub fn status_at(&self, now: Instant) -> BreakerStatus {
        let inner = self.lock();

        let state = if self.config.enabled
            && inner.state == CircuitState::Open
            && inner.cooldown_elapsed(now, self.config.reset_timeout())
        {
            CircuitState::HalfOpen
        } else {
            inner.state
        };

        BreakerStatus {
            target: self.target.clone(),
            enabled: self.config.enabled,
            state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            opened_at: inner.opened_at_utc,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            last_transition: inner.last_transition,
        }
    }

    /// Current logical state
    pub fn state(&self) -> CircuitState {
        self.status().state
    }

    /// Force the breaker into a state (operator override)
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.lock();
        info!(breaker = %self.target, from = %inner.state, to = %state, "Circuit breaker state forced");
        match state {
            CircuitState::Closed => inner.close(),
            CircuitState::Open => inner.open(Instant::now()),
            CircuitState::HalfOpen => {
                inner.state = CircuitState::HalfOpen;
                inner.probe_granted_at = None;
                inner.last_transition = Utc::now();
            }
        }
    }

    /// Reset to CLOSED with counters cleared
    pub fn reset(&self) {
        self.force_state(CircuitState::Closed);
    }
}

/// Lazily-populated set of breakers, one per target
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry where every target uses `defaults`
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use a dedicated configuration for one target
    pub fn with_override(mut self, target: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(target.into(), config);
        self
    }

    /// Breaker for `target`, created on first reference
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(target.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(target)
                .cloned()
                .unwrap_or_else(|| self.defaults.clone());
            debug!(breaker = %target, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(target, config))
        });
        Arc::clone(breaker)
    }

    /// Snapshot of every breaker created so far
    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(target, breaker)| (target.clone(), breaker.status()))
            .collect()
    }
}
