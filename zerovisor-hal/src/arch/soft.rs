//! A software `VirtExtension` implementation driven by an injectable exit
//! queue, used for every test in this repository that would otherwise need
//! real VMLAUNCH/VMRUN hardware.
//!
//! This mirrors the teacher's own `SoftArm64Engine`/`SoftRiscvEngine` pattern
//! (stub engines satisfying the same trait purely so higher layers have
//! something to run unit tests against until a hardware backend is available)
//! generalized from "always succeed with a canned exit" to a queue the test
//! author controls exit-by-exit, which is what the dispatcher, scheduler, and
//! migration engine above this trait actually need to be exercised.

use std::collections::{HashMap, VecDeque};

use crate::cpu_state::CpuState;
use crate::exit::{ExitInfo, ExitQualification, ExitReason, InjectedEvent, InjectedEventKind};
use crate::virt_extension::{HalError, VcpuConfig, VcpuId, Vendor, VirtExtension};

struct SoftVcpu {
    state: CpuState,
    queued_exits: VecDeque<ExitInfo>,
    pending_events: Vec<InjectedEvent>,
    interrupt_shadow: bool,
    interrupt_window_requested: bool,
}

impl SoftVcpu {
    fn new(initial_state: CpuState) -> Self {
        Self {
            state: initial_state,
            queued_exits: VecDeque::new(),
            pending_events: Vec::new(),
            interrupt_shadow: false,
            interrupt_window_requested: false,
        }
    }
}

/// Software `VirtExtension` backend. Tests push [`ExitInfo`] values onto a
/// vCPU's queue with [`SoftBackend::push_exit`]; `enter_guest` pops them in
/// FIFO order, or reports a default HLT exit once the queue is drained (so a
/// test that forgets to queue a terminating exit doesn't hang the scheduler
/// loop it is exercising).
pub struct SoftBackend {
    enabled: bool,
    vcpus: HashMap<VcpuId, SoftVcpu>,
}

impl SoftBackend {
    pub fn new() -> Self {
        Self { enabled: false, vcpus: HashMap::new() }
    }

    /// Queues an exit to be returned by a future `enter_guest` call.
    pub fn push_exit(&mut self, vcpu: VcpuId, exit: ExitInfo) {
        if let Some(v) = self.vcpus.get_mut(&vcpu) {
            v.queued_exits.push_back(exit);
        }
    }

    /// Drains and returns the events injected via `inject_event` so test code
    /// can assert on what the dispatcher queued.
    pub fn take_injected(&mut self, vcpu: VcpuId) -> Vec<InjectedEvent> {
        self.vcpus.get_mut(&vcpu).map(|v| std::mem::take(&mut v.pending_events)).unwrap_or_default()
    }

    pub fn set_interrupt_shadow(&mut self, vcpu: VcpuId, shadow: bool) {
        if let Some(v) = self.vcpus.get_mut(&vcpu) {
            v.interrupt_shadow = shadow;
        }
    }

    pub fn interrupt_window_requested(&self, vcpu: VcpuId) -> bool {
        self.vcpus.get(&vcpu).map(|v| v.interrupt_window_requested).unwrap_or(false)
    }

    fn vcpu_mut(&mut self, vcpu: VcpuId) -> Result<&mut SoftVcpu, HalError> {
        self.vcpus.get_mut(&vcpu).ok_or(HalError::UnknownVcpu(vcpu))
    }
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_HLT_EXIT: ExitInfo = ExitInfo {
    reason: ExitReason::Hlt,
    qualification: ExitQualification::None,
    guest_rip: 0,
    guest_linear: 0,
    error_code: None,
    instruction_len: 1,
};

impl VirtExtension for SoftBackend {
    fn vendor(&self) -> Vendor {
        Vendor::Software
    }

    fn enable(&mut self) -> Result<(), HalError> {
        if self.enabled {
            return Err(HalError::Busy);
        }
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), HalError> {
        self.enabled = false;
        Ok(())
    }

    fn create_vcpu(&mut self, config: VcpuConfig) -> Result<VcpuId, HalError> {
        self.vcpus.insert(config.id, SoftVcpu::new(config.initial_state));
        Ok(config.id)
    }

    fn destroy_vcpu(&mut self, vcpu: VcpuId) -> Result<(), HalError> {
        self.vcpus.remove(&vcpu).ok_or(HalError::UnknownVcpu(vcpu)).map(|_| ())
    }

    fn get_vcpu_state(&self, vcpu: VcpuId) -> Result<CpuState, HalError> {
        self.vcpus.get(&vcpu).map(|v| v.state.clone()).ok_or(HalError::UnknownVcpu(vcpu))
    }

    fn set_vcpu_state(&mut self, vcpu: VcpuId, state: &CpuState) -> Result<(), HalError> {
        self.vcpu_mut(vcpu)?.state = state.clone();
        Ok(())
    }

    fn enter_guest(&mut self, vcpu: VcpuId) -> Result<ExitInfo, HalError> {
        let v = self.vcpu_mut(vcpu)?;
        Ok(v.queued_exits.pop_front().unwrap_or(DEFAULT_HLT_EXIT))
    }

    fn inject_event(&mut self, vcpu: VcpuId, event: InjectedEvent) -> Result<(), HalError> {
        let v = self.vcpu_mut(vcpu)?;
        if v.interrupt_shadow && !matches!(event.kind, InjectedEventKind::Nmi) {
            return Err(HalError::ControlStructureFailure(0));
        }
        v.pending_events.push(event);
        Ok(())
    }

    fn interrupt_shadow(&self, vcpu: VcpuId) -> bool {
        self.vcpus.get(&vcpu).map(|v| v.interrupt_shadow).unwrap_or(false)
    }

    fn request_interrupt_window(&mut self, vcpu: VcpuId) -> Result<(), HalError> {
        self.vcpu_mut(vcpu)?.interrupt_window_requested = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_guest_returns_queued_exit_in_order() {
        let mut backend = SoftBackend::new();
        backend.enable().unwrap();
        let id = backend.create_vcpu(VcpuConfig { id: 0, initial_state: CpuState::default() }).unwrap();
        backend.push_exit(id, ExitInfo {
            reason: ExitReason::Cpuid,
            qualification: ExitQualification::None,
            guest_rip: 0x1000,
            guest_linear: 0,
            error_code: None,
            instruction_len: 2,
        });
        let exit = backend.enter_guest(id).unwrap();
        assert_eq!(exit.reason, ExitReason::Cpuid);
        assert_eq!(exit.guest_rip, 0x1000);

        let next = backend.enter_guest(id).unwrap();
        assert_eq!(next.reason, ExitReason::Hlt, "drained queue defaults to HLT");
    }

    #[test]
    fn inject_event_respects_interrupt_shadow() {
        let mut backend = SoftBackend::new();
        let id = backend.create_vcpu(VcpuConfig { id: 0, initial_state: CpuState::default() }).unwrap();
        backend.set_interrupt_shadow(id, true);
        let ev = InjectedEvent { vector: 0x20, kind: InjectedEventKind::ExternalInterrupt, error_code: None };
        assert!(backend.inject_event(id, ev).is_err());

        let nmi = InjectedEvent { vector: 2, kind: InjectedEventKind::Nmi, error_code: None };
        assert!(backend.inject_event(id, nmi).is_ok());
    }

    #[test]
    fn unknown_vcpu_is_an_error() {
        let mut backend = SoftBackend::new();
        assert_eq!(backend.enter_guest(99), Err(HalError::UnknownVcpu(99)));
    }
}
