//! vCPU Scheduler (§4.7): one OS thread per vCPU running the exit loop,
//! coordinated by a shared VM-wide phase and each vCPU's own park/wake.
//!
//! Deliberately not grounded in the teacher's `QuantumScheduler`
//! (`zerovisor-core::scheduler`) — that type implements a single
//! priority/round-robin run-queue for cooperatively multiplexing many
//! vCPUs onto few physical cores, a different concurrency model than one
//! OS thread per vCPU. It is grounded instead in the HAL's own threading
//! assumptions (`VirtExtension::enter_guest` blocks the calling thread
//! until exit, exactly the shape a dedicated per-vCPU thread wants) and in
//! §4.7/§5's explicit "parallel OS threads, one per vCPU" model.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::vcpu::{ExecutionState, Vcpu};

/// VM-wide scheduling phase (§4.7), observed by every vCPU thread after
/// each exit and before re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Running = 0,
    Pausing = 1,
    Paused = 2,
    Stopping = 3,
    Stopped = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Running,
            1 => Phase::Pausing,
            2 => Phase::Paused,
            3 => Phase::Stopping,
            _ => Phase::Stopped,
        }
    }
}

/// Lock-free VM-wide phase flag (§5 "the VM-wide phase... use lock-free
/// atomics"), shared by every vCPU thread and by the control-plane callers
/// (`pause`/`resume`/`stop`).
pub struct SharedPhase {
    raw: AtomicU8,
}

impl SharedPhase {
    pub fn new() -> Self {
        Self { raw: AtomicU8::new(Phase::Running as u8) }
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.raw.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: Phase) {
        self.raw.store(phase as u8, Ordering::Release);
    }
}

impl Default for SharedPhase {
    fn default() -> Self {
        Self::new()
    }
}

/// What a vCPU thread's exit-loop body should do this iteration, decided by
/// checking [`SharedPhase`] after an exit and before re-entry (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Re-enter the guest immediately.
    ReEnter,
    /// Transition to `Paused` and block until the phase leaves `Pausing`.
    ParkForPause,
    /// Return from the thread's run function; the scheduler is stopping.
    Exit,
}

/// Decides the next action for a vCPU thread, given the VM-wide phase and
/// the vCPU's own state (§4.7's per-iteration phase check).
pub fn next_action(phase: Phase, vcpu: &Vcpu) -> LoopAction {
    match phase {
        Phase::Running => LoopAction::ReEnter,
        Phase::Pausing | Phase::Paused => {
            if vcpu.state() != ExecutionState::Paused {
                vcpu.set_state(ExecutionState::Paused);
            }
            LoopAction::ParkForPause
        }
        Phase::Stopping | Phase::Stopped => LoopAction::Exit,
    }
}

/// Owns the per-vCPU OS threads for one VM. Constructed with the thread
/// bodies already spawned (one per vCPU); `stop` sets the shared phase and
/// joins every thread, matching §4.7's cancellation contract — no in-flight
/// exit handler is aborted, each thread observes `Stopping` at its own next
/// exit.
pub struct Scheduler {
    phase: Arc<SharedPhase>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(phase: Arc<SharedPhase>) -> Self {
        Self { phase, handles: Vec::new() }
    }

    pub fn phase_handle(&self) -> Arc<SharedPhase> {
        Arc::clone(&self.phase)
    }

    /// Registers a spawned vCPU thread so `stop`/`join_all` can wait on it.
    pub fn register(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn pause(&self) {
        self.phase.set(Phase::Pausing);
    }

    pub fn resume(&self) {
        self.phase.set(Phase::Running);
    }

    /// Sets phase to `Stopping` and joins every registered thread. A thread
    /// parked on pause (on the VM's own pause condvar, not `Vcpu::wake`)
    /// still observes `Stopping` on its next wake, since the VM notifies
    /// that condvar on every phase transition.
    pub fn stop(mut self) {
        self.phase.set(Phase::Stopping);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.phase.set(Phase::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_phase_reenters() {
        let vcpu = Vcpu::new(0);
        assert_eq!(next_action(Phase::Running, &vcpu), LoopAction::ReEnter);
    }

    #[test]
    fn pausing_phase_parks_and_marks_vcpu_paused() {
        let vcpu = Vcpu::new(0);
        assert_eq!(next_action(Phase::Pausing, &vcpu), LoopAction::ParkForPause);
        assert_eq!(vcpu.state(), ExecutionState::Paused);
    }

    #[test]
    fn stopping_phase_exits() {
        let vcpu = Vcpu::new(0);
        assert_eq!(next_action(Phase::Stopping, &vcpu), LoopAction::Exit);
    }

    #[test]
    fn shared_phase_round_trips_through_atomic() {
        let phase = SharedPhase::new();
        assert_eq!(phase.get(), Phase::Running);
        phase.set(Phase::Stopping);
        assert_eq!(phase.get(), Phase::Stopping);
    }
}
