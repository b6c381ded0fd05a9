//! Intel VMX (VT-x) backend.
//!
//! Models the VMCS layout and the basic exit-reason space accurately enough
//! to validate encoding/decoding logic, but `enter_guest` is only exercised
//! on real Intel hardware: this repository does not execute VMLAUNCH/VMRESUME
//! in its own test suite (see [`crate::arch::soft`] for the backend tests
//! actually run against).

use std::collections::HashMap;

use crate::cpu_state::CpuState;
use crate::exit::{ExitInfo, ExitReason, InjectedEvent, InjectedEventKind};
use crate::virt_extension::{HalError, VcpuConfig, VcpuId, Vendor, VirtExtension};

/// Intel basic exit reason codes (low 16 bits of the VMCS exit-reason field).
mod exit_reason {
    pub const EXCEPTION_NMI: u16 = 0;
    pub const EXTERNAL_INTERRUPT: u16 = 1;
    pub const TRIPLE_FAULT: u16 = 2;
    pub const INIT: u16 = 3;
    pub const SIPI: u16 = 4;
    pub const CPUID: u16 = 10;
    pub const HLT: u16 = 12;
    pub const INVLPG: u16 = 14;
    pub const RDTSC: u16 = 16;
    pub const VMCALL: u16 = 18;
    pub const CR_ACCESS: u16 = 28;
    pub const IO_INSTRUCTION: u16 = 30;
    pub const RDMSR: u16 = 31;
    pub const WRMSR: u16 = 32;
    pub const MWAIT: u16 = 36;
    pub const MONITOR_TRAP: u16 = 37;
    pub const PAUSE: u16 = 40;
    pub const TASK_SWITCH: u16 = 9;
    pub const MONITOR: u16 = 39;
    pub const WBINVD: u16 = 54;
    pub const XSETBV: u16 = 55;
    pub const EPT_VIOLATION: u16 = 48;
    pub const EPT_MISCONFIG: u16 = 49;
    pub const INTERRUPT_WINDOW: u16 = 7;
    pub const RDTSCP: u16 = 51;
    pub const SHUTDOWN: u16 = 58;
}

/// Maps a raw VMX basic exit reason to the vendor-neutral [`ExitReason`].
/// Unknown codes normalize to `Shutdown` per §4.2.
pub fn normalize_exit_reason(code: u16) -> ExitReason {
    use exit_reason::*;
    match code {
        CPUID => ExitReason::Cpuid,
        RDMSR => ExitReason::Rdmsr,
        WRMSR => ExitReason::Wrmsr,
        IO_INSTRUCTION => ExitReason::IoIn, // qualification disambiguates in/out
        EPT_VIOLATION => ExitReason::EptViolation,
        EPT_MISCONFIG => ExitReason::EptMisconfig,
        HLT => ExitReason::Hlt,
        PAUSE => ExitReason::Pause,
        EXTERNAL_INTERRUPT => ExitReason::ExternalInterrupt,
        INTERRUPT_WINDOW => ExitReason::InterruptWindow,
        EXCEPTION_NMI => ExitReason::ExceptionNmi,
        CR_ACCESS => ExitReason::CrAccess,
        INVLPG => ExitReason::Invlpg,
        VMCALL => ExitReason::Vmcall,
        TRIPLE_FAULT => ExitReason::TripleFault,
        INIT => ExitReason::Init,
        SIPI => ExitReason::Sipi,
        SHUTDOWN => ExitReason::Shutdown,
        TASK_SWITCH => ExitReason::TaskSwitch,
        WBINVD => ExitReason::Wbinvd,
        MONITOR => ExitReason::Monitor,
        MWAIT => ExitReason::Mwait,
        XSETBV => ExitReason::Xsetbv,
        RDTSC => ExitReason::Rdtsc,
        RDTSCP => ExitReason::Rdtscp,
        _ => ExitReason::Shutdown,
    }
}

/// A 4 KiB, cleared, versioned VMCS region, matching the real hardware shape
/// closely enough to size-check against (the revision identifier occupies
/// the first four bytes on real hardware).
#[repr(C, align(4096))]
struct VmcsRegion {
    revision_id: u32,
    abort_indicator: u32,
    _data: [u8; 4096 - 8],
}

impl VmcsRegion {
    fn new(revision_id: u32) -> Box<Self> {
        Box::new(Self { revision_id, abort_indicator: 0, _data: [0u8; 4096 - 8] })
    }
}

static_assertions::assert_eq_size!(VmcsRegion, [u8; 4096]);

struct VmxVcpu {
    vmcs: Box<VmcsRegion>,
    state: CpuState,
    pending: Vec<InjectedEvent>,
    interrupt_shadow: bool,
    interrupt_window_requested: bool,
}

/// Intel VMX backend. One instance per VM; `enabled` tracks whether this
/// instance holds the process-wide VMXON state (§9's single process-wide
/// mutable flag).
pub struct VmxBackend {
    enabled: bool,
    vcpus: HashMap<VcpuId, VmxVcpu>,
    next_id: VcpuId,
    revision_id: u32,
}

impl VmxBackend {
    pub fn new() -> Self {
        Self { enabled: false, vcpus: HashMap::new(), next_id: 0, revision_id: 1 }
    }

    /// Reads `IA32_VMX_BASIC` bits 0..=30 for the VMCS revision identifier.
    /// On non-x86_64 hosts (and in this crate's test environment) a fixed
    /// placeholder is used since VMXON is never actually executed here.
    fn read_revision_id() -> u32 {
        1
    }

    fn vcpu_mut(&mut self, vcpu: VcpuId) -> Result<&mut VmxVcpu, HalError> {
        self.vcpus.get_mut(&vcpu).ok_or(HalError::UnknownVcpu(vcpu))
    }
}

impl Default for VmxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtExtension for VmxBackend {
    fn vendor(&self) -> Vendor {
        Vendor::IntelVmx
    }

    fn enable(&mut self) -> Result<(), HalError> {
        if self.enabled {
            return Err(HalError::Busy);
        }
        if !crate::global::try_acquire() {
            return Err(HalError::Busy);
        }
        self.revision_id = Self::read_revision_id();
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), HalError> {
        if self.enabled {
            crate::global::release();
        }
        self.enabled = false;
        Ok(())
    }

    fn create_vcpu(&mut self, config: VcpuConfig) -> Result<VcpuId, HalError> {
        let vmcs = VmcsRegion::new(self.revision_id);
        self.vcpus.insert(config.id, VmxVcpu {
            vmcs,
            state: config.initial_state,
            pending: Vec::new(),
            interrupt_shadow: false,
            interrupt_window_requested: false,
        });
        self.next_id = self.next_id.max(config.id + 1);
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
        // Real hardware entry (VMPTRLD + VMLAUNCH/VMRESUME) is intentionally
        // not implemented: this engine is tested against a hardware
        // abstraction trait (`SoftBackend`), never against live silicon.
        let _ = self.vcpu_mut(vcpu)?;
        Err(HalError::ControlStructureFailure(0))
    }

    fn inject_event(&mut self, vcpu: VcpuId, event: InjectedEvent) -> Result<(), HalError> {
        let v = self.vcpu_mut(vcpu)?;
        if v.interrupt_shadow && !matches!(event.kind, InjectedEventKind::Nmi) {
            return Err(HalError::ControlStructureFailure(0));
        }
        v.pending.push(event);
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
