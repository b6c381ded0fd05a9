//! Per-vCPU execution state machine, pending-interrupt queue, and
//! performance counters (§3 "vCPU", §4.7).
//!
//! The register snapshot and control structure (VMCS/VMCB) live behind the
//! [`zerovisor_hal::VirtExtension`] trait; this module owns everything the
//! engine tracks *about* a vCPU above that seam: which state it is in, what
//! is queued for injection, and how long it has been running.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use zerovisor_hal::exit::{InjectedEvent, InjectedEventKind, InterruptVector};
use zerovisor_hal::virt_extension::VcpuId;

/// Per-vCPU execution state machine (§3): `Running → PendingExit → Exited →
/// (Running | Halted | Paused | Faulted)`. Only `Running` may be entered with
/// the control structure loaded on the current CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    PendingExit,
    Exited,
    Halted,
    Paused,
    Faulted,
}

/// A pending interrupt, ordered by priority (vector number, highest first —
/// matching the APIC convention that higher vectors are higher priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingInterrupt {
    vector: InterruptVector,
    kind: InjectedEventKind,
}

/// Running performance counters, exposed for forensics and WCET-style
/// watchdog bookkeeping (§4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct VcpuCounters {
    pub exits: u64,
    pub halts: u64,
    pub injected_events: u64,
}

struct Inner {
    state: ExecutionState,
    pending: Vec<PendingInterrupt>,
    nmi_pending: bool,
    interrupt_shadow: bool,
    counters: VcpuCounters,
    last_exit_at: Instant,
}

/// Engine-side bookkeeping for one vCPU, owned exclusively by its
/// `VirtualMachine` and mutated only by its own execution thread, except
/// when paused (migration/snapshot path may then read/write state).
pub struct Vcpu {
    pub id: VcpuId,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Vcpu {
    pub fn new(id: VcpuId) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                state: ExecutionState::Running,
                pending: Vec::new(),
                nmi_pending: false,
                interrupt_shadow: false,
                counters: VcpuCounters::default(),
                last_exit_at: Instant::now(),
            }),
            wake: Condvar::new(),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.lock().unwrap().state
    }

    pub fn set_state(&self, state: ExecutionState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        drop(inner);
        self.wake.notify_all();
    }

    pub fn counters(&self) -> VcpuCounters {
        self.inner.lock().unwrap().counters
    }

    pub fn record_exit(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.exits += 1;
        inner.last_exit_at = Instant::now();
    }

    /// Elapsed time since the last recorded exit, the quantity the watchdog
    /// compares against `watchdog_timeout_ms` (§4.6).
    pub fn time_since_last_exit(&self) -> Duration {
        self.inner.lock().unwrap().last_exit_at.elapsed()
    }

    /// Queues an interrupt for the dispatcher's injection policy to
    /// consider on its next pass (§4.2 "Interrupt injection policy").
    pub fn queue_interrupt(&self, vector: InterruptVector, kind: InjectedEventKind) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.push(PendingInterrupt { vector, kind });
        drop(inner);
        self.wake.notify_all();
    }

    pub fn raise_nmi(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.nmi_pending = true;
        drop(inner);
        self.wake.notify_all();
    }

    pub fn nmi_pending(&self) -> bool {
        self.inner.lock().unwrap().nmi_pending
    }

    pub fn clear_nmi_pending(&self) {
        self.inner.lock().unwrap().nmi_pending = false;
    }

    pub fn set_interrupt_shadow(&self, shadow: bool) {
        self.inner.lock().unwrap().interrupt_shadow = shadow;
    }

    pub fn interrupt_shadow(&self) -> bool {
        self.inner.lock().unwrap().interrupt_shadow
    }

    pub fn has_pending_interrupt(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }

    /// Pops the highest-priority pending vector compatible with `eflags_if`
    /// and the current interrupt-shadow/NMI-blocking state (§4.2's
    /// injection policy). NMIs bypass EFLAGS.IF but still respect shadow.
    pub fn take_next_injectable(&self, eflags_if: bool) -> Option<InjectedEvent> {
        let mut inner = self.inner.lock().unwrap();
        if inner.interrupt_shadow {
            return None;
        }
        if inner.nmi_pending {
            inner.nmi_pending = false;
            inner.counters.injected_events += 1;
            return Some(InjectedEvent { vector: 2, kind: InjectedEventKind::Nmi, error_code: None });
        }
        if !eflags_if || inner.pending.is_empty() {
            return None;
        }
        let (best_idx, _) = inner
            .pending
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| p.vector)
            .expect("checked non-empty above");
        let picked = inner.pending.remove(best_idx);
        inner.counters.injected_events += 1;
        Some(InjectedEvent { vector: picked.vector, kind: picked.kind, error_code: None })
    }

    /// Parks the calling thread (the vCPU's own execution thread) until
    /// woken by an interrupt, an NMI, or a state change — the HLT handler's
    /// sole blocking point (§4.2, §5 "Suspension points").
    pub fn park_while_halted(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.halts += 1;
        while inner.state == ExecutionState::Halted
            && inner.pending.is_empty()
            && !inner.nmi_pending
        {
            inner = self.wake.wait(inner).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmi_bypasses_ifclear_but_respects_shadow() {
        let vcpu = Vcpu::new(0);
        vcpu.raise_nmi();
        vcpu.set_interrupt_shadow(true);
        assert!(vcpu.take_next_injectable(false).is_none(), "shadow blocks even NMI");
        vcpu.set_interrupt_shadow(false);
        let ev = vcpu.take_next_injectable(false).unwrap();
        assert_eq!(ev.kind, InjectedEventKind::Nmi);
    }

    #[test]
    fn highest_vector_wins_and_if_clear_blocks_regular_interrupts() {
        let vcpu = Vcpu::new(0);
        vcpu.queue_interrupt(0x20, InjectedEventKind::ExternalInterrupt);
        vcpu.queue_interrupt(0x41, InjectedEventKind::ExternalInterrupt);
        assert!(vcpu.take_next_injectable(false).is_none());
        let ev = vcpu.take_next_injectable(true).unwrap();
        assert_eq!(ev.vector, 0x41);
        let ev2 = vcpu.take_next_injectable(true).unwrap();
        assert_eq!(ev2.vector, 0x20);
        assert!(vcpu.take_next_injectable(true).is_none());
    }

    #[test]
    fn state_transitions_are_observable() {
        let vcpu = Vcpu::new(3);
        assert_eq!(vcpu.state(), ExecutionState::Running);
        vcpu.set_state(ExecutionState::Halted);
        assert_eq!(vcpu.state(), ExecutionState::Halted);
    }
}
