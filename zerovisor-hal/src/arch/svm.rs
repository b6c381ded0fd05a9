//! AMD SVM (AMD-V) backend.
//!
//! Structurally mirrors [`crate::arch::vmx::VmxBackend`] but owns a VMCB
//! instead of a VMCS and maps SVM exit codes onto the shared
//! [`crate::exit::ExitReason`] space via a fixed table (§4.1: "on AMD, exit
//! codes are mapped to the Intel-equivalent reason space before return").

use std::collections::HashMap;

use crate::cpu_state::CpuState;
use crate::exit::{ExitInfo, ExitReason, InjectedEvent, InjectedEventKind};
use crate::virt_extension::{HalError, VcpuConfig, VcpuId, Vendor, VirtExtension};

/// Raw AMD SVM `#VMEXIT` codes relevant to the dispatcher's required table.
mod vmexit_code {
    pub const EXCP_BASE: i64 = 0x40; // VMEXIT_EXCP0 + vector
    pub const INTR: i64 = 0x60;
    pub const NMI: i64 = 0x61;
    pub const SMI: i64 = 0x62;
    pub const INIT: i64 = 0x63;
    pub const VINTR: i64 = 0x64;
    pub const CR0_SEL_WRITE: i64 = 0x65;
    pub const IOIO: i64 = 0x7B;
    pub const MSR: i64 = 0x7C;
    pub const TASK_SWITCH: i64 = 0x7D;
    pub const SHUTDOWN: i64 = 0x7F;
    pub const VMMCALL: i64 = 0x81;
    pub const INVLPG: i64 = 0x82;
    pub const CPUID: i64 = 0x72;
    pub const RDTSC: i64 = 0x6E;
    pub const RDTSCP: i64 = 0x87;
    pub const MWAIT: i64 = 0x8B;
    pub const MONITOR: i64 = 0x8A;
    pub const PAUSE: i64 = 0x77;
    pub const HLT: i64 = 0x78;
    pub const WBINVD: i64 = 0x89;
    pub const XSETBV: i64 = 0x8D;
    pub const NPF: i64 = 0x400; // nested page fault
}

/// Maps a raw SVM `#VMEXIT` code to the vendor-neutral [`ExitReason`].
/// Unknown/unmapped codes normalize to `Shutdown` per §4.2, same as the VMX
/// side, so the dispatcher's fixed handler table never needs to know which
/// vendor produced the exit.
pub fn normalize_exit_reason(code: i64) -> ExitReason {
    use vmexit_code::*;
    match code {
        CPUID => ExitReason::Cpuid,
        MSR => ExitReason::Rdmsr, // disambiguated by the VMCB's IN/OUT bit
        IOIO => ExitReason::IoIn,
        NPF => ExitReason::EptViolation,
        HLT => ExitReason::Hlt,
        PAUSE => ExitReason::Pause,
        INTR => ExitReason::ExternalInterrupt,
        VINTR => ExitReason::InterruptWindow,
        NMI | SMI => ExitReason::ExceptionNmi,
        CR0_SEL_WRITE => ExitReason::CrAccess,
        INVLPG => ExitReason::Invlpg,
        VMMCALL => ExitReason::Vmcall,
        INIT => ExitReason::Init,
        SHUTDOWN => ExitReason::Shutdown,
        TASK_SWITCH => ExitReason::TaskSwitch,
        WBINVD => ExitReason::Wbinvd,
        MONITOR => ExitReason::Monitor,
        MWAIT => ExitReason::Mwait,
        XSETBV => ExitReason::Xsetbv,
        RDTSC => ExitReason::Rdtsc,
        RDTSCP => ExitReason::Rdtscp,
        c if (EXCP_BASE..EXCP_BASE + 32).contains(&c) => ExitReason::ExceptionNmi,
        _ => ExitReason::Shutdown,
    }
}

#[repr(C, align(4096))]
struct VmcbRegion {
    _control_area: [u8; 1024],
    _save_area: [u8; 4096 - 1024],
}

impl VmcbRegion {
    fn new() -> Box<Self> {
        Box::new(Self { _control_area: [0u8; 1024], _save_area: [0u8; 4096 - 1024] })
    }
}

static_assertions::assert_eq_size!(VmcbRegion, [u8; 4096]);

struct SvmVcpu {
    vmcb: Box<VmcbRegion>,
    state: CpuState,
    pending: Vec<InjectedEvent>,
    interrupt_shadow: bool,
    interrupt_window_requested: bool,
}

/// AMD SVM backend.
pub struct SvmBackend {
    enabled: bool,
    vcpus: HashMap<VcpuId, SvmVcpu>,
}

impl SvmBackend {
    pub fn new() -> Self {
        Self { enabled: false, vcpus: HashMap::new() }
    }

    fn vcpu_mut(&mut self, vcpu: VcpuId) -> Result<&mut SvmVcpu, HalError> {
        self.vcpus.get_mut(&vcpu).ok_or(HalError::UnknownVcpu(vcpu))
    }
}

impl Default for SvmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtExtension for SvmBackend {
    fn vendor(&self) -> Vendor {
        Vendor::AmdSvm
    }

    fn enable(&mut self) -> Result<(), HalError> {
        if self.enabled {
            return Err(HalError::Busy);
        }
        if !crate::global::try_acquire() {
            return Err(HalError::Busy);
        }
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
        self.vcpus.insert(config.id, SvmVcpu {
            vmcb: VmcbRegion::new(),
            state: config.initial_state,
            pending: Vec::new(),
            interrupt_shadow: false,
            interrupt_window_requested: false,
        });
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
        // As with the VMX backend, real VMRUN execution is out of scope for
        // this repository's test environment; see `crate::arch::soft`.
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
