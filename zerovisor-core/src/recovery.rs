//! Error / Recovery Core (§4.6): uniform exception classification, a
//! configurable per-kind recovery strategy, a bounded forensic ring buffer,
//! and the watchdog that enforces forward progress.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use zerovisor_hal::virt_extension::VcpuId;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("exception ring buffer capacity must be nonzero")]
    ZeroCapacity,
}

/// The 19 architecturally defined x86 exception vectors, plus synthetic
/// kinds for IOMMU faults, watchdog timeouts, device faults, migration
/// failures, and state-validation failures (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    De,
    Db,
    Nmi,
    Bp,
    Of,
    Br,
    Ud,
    Nm,
    Df,
    Cso,
    Ts,
    Np,
    Ss,
    Gp,
    Pf,
    Mf,
    Ac,
    Mc,
    Xm,
    IommuFault,
    WatchdogTimeout,
    DeviceFault,
    MigrationFailure,
    StateValidationFailure,
}

/// Maps an x86 exception vector number to its [`ExceptionKind`]. Vectors
/// with no architectural meaning classify as `Gp` (closest catch-all), used
/// by [`decision_for_vector`] for exits the dispatcher doesn't special-case.
pub fn kind_for_vector(vector: u8) -> ExceptionKind {
    match vector {
        0 => ExceptionKind::De,
        1 => ExceptionKind::Db,
        2 => ExceptionKind::Nmi,
        3 => ExceptionKind::Bp,
        4 => ExceptionKind::Of,
        5 => ExceptionKind::Br,
        6 => ExceptionKind::Ud,
        7 => ExceptionKind::Nm,
        8 => ExceptionKind::Df,
        9 => ExceptionKind::Cso,
        10 => ExceptionKind::Ts,
        11 => ExceptionKind::Np,
        12 => ExceptionKind::Ss,
        13 => ExceptionKind::Gp,
        14 => ExceptionKind::Pf,
        16 => ExceptionKind::Mf,
        17 => ExceptionKind::Ac,
        18 => ExceptionKind::Mc,
        19 => ExceptionKind::Xm,
        _ => ExceptionKind::Gp,
    }
}

/// Tagged recovery action (§3 `RecoveryDecision`). Exhaustively matched by
/// the VM's fault-application path, never dispatched virtually (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Ignore,
    ResetDevice(u16),
    ResetVCpu(VcpuId),
    HardReset,
    PauseVm,
    RestoreSnapshot(u64),
    IsolateDevice(u16),
    Shutdown,
}

/// The default per-kind strategy (§4.6's table), used unless the embedder
/// installs an override via [`RecoveryManager::set_strategy`].
fn default_strategy(kind: ExceptionKind) -> RecoveryDecision {
    match kind {
        ExceptionKind::Pf => RecoveryDecision::ResetVCpu(0),
        ExceptionKind::Mc => RecoveryDecision::Shutdown,
        ExceptionKind::Df => RecoveryDecision::HardReset,
        ExceptionKind::Ud => RecoveryDecision::ResetVCpu(0),
        ExceptionKind::IommuFault => RecoveryDecision::IsolateDevice(0),
        ExceptionKind::WatchdogTimeout => RecoveryDecision::PauseVm,
        ExceptionKind::MigrationFailure => RecoveryDecision::Ignore,
        _ => RecoveryDecision::ResetVCpu(0),
    }
}

/// Given a raw exception vector (from an `ExceptionNmi` exit's
/// qualification), returns the default recovery decision for its kind. The
/// vCPU id embedded in `ResetVCpu(0)`/`IsolateDevice(0)` placeholders is
/// overwritten by the caller, which knows which vCPU/device faulted; see
/// [`RecoveryManager::classify_and_decide`] for the stateful, retry-aware
/// path used by the VM's fault-handling loop.
pub fn decision_for_vector(vector: u8) -> RecoveryDecision {
    default_strategy(kind_for_vector(vector))
}

/// A single ring-buffer record (§3 `ExceptionContext`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionContext {
    pub kind: ExceptionKind,
    pub guest_rip: u64,
    pub cr3: u64,
    pub error_code: Option<u32>,
    pub retry_count: u32,
    pub timestamp: Instant,
}

struct RetryState {
    count: u32,
    window_start: Instant,
}

/// Per-VM recovery state: the strategy map, the bounded exception ring, and
/// per-kind retry counters used to escalate after repeated failures.
pub struct RecoveryManager {
    strategy: Mutex<HashMap<ExceptionKind, RecoveryDecision>>,
    ring: Mutex<std::collections::VecDeque<ExceptionContext>>,
    ring_capacity: usize,
    retries: Mutex<HashMap<ExceptionKind, RetryState>>,
    max_retries: u32,
    retry_window: Duration,
    watchdog_timeout: Duration,
    watchdog_backoff_base: Duration,
}

pub struct RecoveryConfig {
    pub ring_capacity: usize,
    pub max_retries: u32,
    pub retry_window: Duration,
    pub watchdog_timeout: Duration,
    /// Base of the exponential backoff applied to repeated `ResetVCpu`
    /// decisions within the retry window (§9 open question — exposed as a
    /// tunable rather than a hardcoded constant).
    pub watchdog_backoff_base: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            max_retries: 3,
            retry_window: Duration::from_secs(60),
            watchdog_timeout: Duration::from_millis(5000),
            watchdog_backoff_base: Duration::from_millis(100),
        }
    }
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Result<Self, RecoveryError> {
        if config.ring_capacity == 0 {
            return Err(RecoveryError::ZeroCapacity);
        }
        Ok(Self {
            strategy: Mutex::new(HashMap::new()),
            ring: Mutex::new(std::collections::VecDeque::with_capacity(config.ring_capacity)),
            ring_capacity: config.ring_capacity,
            retries: Mutex::new(HashMap::new()),
            max_retries: config.max_retries,
            retry_window: config.retry_window,
            watchdog_timeout: config.watchdog_timeout,
            watchdog_backoff_base: config.watchdog_backoff_base,
        })
    }

    pub fn set_strategy(&self, kind: ExceptionKind, decision: RecoveryDecision) {
        self.strategy.lock().unwrap().insert(kind, decision);
    }

    fn strategy_for(&self, kind: ExceptionKind) -> RecoveryDecision {
        self.strategy.lock().unwrap().get(&kind).copied().unwrap_or_else(|| default_strategy(kind))
    }

    /// Records a context in the ring buffer (oldest discarded on overflow)
    /// and logs at a severity matched to the decision kind.
    fn record(&self, ctx: ExceptionContext, decision: RecoveryDecision) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(ctx);
        drop(ring);
        match decision {
            RecoveryDecision::Ignore => log::debug!("recovery: {:?} -> {:?}", ctx.kind, decision),
            RecoveryDecision::Shutdown | RecoveryDecision::HardReset => {
                log::error!("recovery: {:?} at rip={:#x} -> {:?}", ctx.kind, ctx.guest_rip, decision)
            }
            _ => log::warn!("recovery: {:?} at rip={:#x} -> {:?}", ctx.kind, ctx.guest_rip, decision),
        }
    }

    /// Classifies `kind` at `guest_rip`/`cr3`, applies the strategy map, and
    /// escalates (typically to `PauseVm`) once the kind's retry counter
    /// exceeds `max_retries` within the sliding window (§4.6, §7).
    pub fn classify_and_decide(
        &self,
        kind: ExceptionKind,
        guest_rip: u64,
        cr3: u64,
        error_code: Option<u32>,
    ) -> RecoveryDecision {
        let now = Instant::now();
        let mut retries = self.retries.lock().unwrap();
        let state = retries.entry(kind).or_insert(RetryState { count: 0, window_start: now });
        if now.duration_since(state.window_start) > self.retry_window {
            state.count = 0;
            state.window_start = now;
        }
        state.count += 1;
        let retry_count = state.count;
        let escalate = retry_count > self.max_retries;
        drop(retries);

        let base_decision = self.strategy_for(kind);
        let decision = if escalate {
            match base_decision {
                RecoveryDecision::Shutdown | RecoveryDecision::HardReset => base_decision,
                _ => RecoveryDecision::PauseVm,
            }
        } else {
            base_decision
        };

        self.record(
            ExceptionContext { kind, guest_rip, cr3, error_code, retry_count, timestamp: now },
            decision,
        );
        decision
    }

    /// Returns the backoff delay to wait before retrying a `ResetVCpu`, for
    /// the `retry_count`-th attempt (exponential, §4.6/§9).
    pub fn backoff_for_retry(&self, retry_count: u32) -> Duration {
        self.watchdog_backoff_base.saturating_mul(1u32.checked_shl(retry_count).unwrap_or(u32::MAX))
    }

    /// True when `elapsed` since the vCPU's last exit exceeds the watchdog
    /// deadline (§4.6, §8 invariant 8).
    pub fn watchdog_expired(&self, elapsed: Duration) -> bool {
        elapsed > self.watchdog_timeout
    }

    /// Snapshot of the forensic ring buffer, oldest first, for export.
    pub fn ring_snapshot(&self) -> Vec<ExceptionContext> {
        self.ring.lock().unwrap().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_matches_table() {
        assert_eq!(default_strategy(ExceptionKind::Mc), RecoveryDecision::Shutdown);
        assert_eq!(default_strategy(ExceptionKind::Df), RecoveryDecision::HardReset);
        assert_eq!(default_strategy(ExceptionKind::WatchdogTimeout), RecoveryDecision::PauseVm);
    }

    #[test]
    fn retry_escalation_after_max_retries() {
        let mgr = RecoveryManager::new(RecoveryConfig { max_retries: 2, ..RecoveryConfig::default() }).unwrap();
        mgr.set_strategy(ExceptionKind::Ud, RecoveryDecision::ResetVCpu(0));
        assert_eq!(mgr.classify_and_decide(ExceptionKind::Ud, 0, 0, None), RecoveryDecision::ResetVCpu(0));
        assert_eq!(mgr.classify_and_decide(ExceptionKind::Ud, 0, 0, None), RecoveryDecision::ResetVCpu(0));
        assert_eq!(mgr.classify_and_decide(ExceptionKind::Ud, 0, 0, None), RecoveryDecision::PauseVm);
    }

    #[test]
    fn shutdown_kind_never_deescalates_from_escalation() {
        let mgr = RecoveryManager::new(RecoveryConfig { max_retries: 0, ..RecoveryConfig::default() }).unwrap();
        assert_eq!(mgr.classify_and_decide(ExceptionKind::Mc, 0, 0, None), RecoveryDecision::Shutdown);
    }

    #[test]
    fn ring_buffer_discards_oldest_on_overflow() {
        let mgr = RecoveryManager::new(RecoveryConfig { ring_capacity: 2, ..RecoveryConfig::default() }).unwrap();
        mgr.classify_and_decide(ExceptionKind::Bp, 1, 0, None);
        mgr.classify_and_decide(ExceptionKind::Bp, 2, 0, None);
        mgr.classify_and_decide(ExceptionKind::Bp, 3, 0, None);
        let ring = mgr.ring_snapshot();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0].guest_rip, 2);
        assert_eq!(ring[1].guest_rip, 3);
    }

    #[test]
    fn watchdog_expiry_detection() {
        let mgr = RecoveryManager::new(RecoveryConfig {
            watchdog_timeout: Duration::from_millis(10),
            ..RecoveryConfig::default()
        })
        .unwrap();
        assert!(!mgr.watchdog_expired(Duration::from_millis(5)));
        assert!(mgr.watchdog_expired(Duration::from_millis(20)));
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let mgr = RecoveryManager::new(RecoveryConfig {
            watchdog_backoff_base: Duration::from_millis(100),
            ..RecoveryConfig::default()
        })
        .unwrap();
        assert_eq!(mgr.backoff_for_retry(0), Duration::from_millis(100));
        assert_eq!(mgr.backoff_for_retry(1), Duration::from_millis(200));
        assert_eq!(mgr.backoff_for_retry(2), Duration::from_millis(400));
    }
}
