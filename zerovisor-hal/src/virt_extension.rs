//! The `VirtExtension` capability: the single trait the rest of the engine
//! is written against, so that every vendor- or test-specific detail lives
//! behind one seam (§4.1).

use thiserror::Error;

use crate::cpu_state::CpuState;
use crate::exit::{ExitInfo, InjectedEvent};

/// Dense integer handle for a vCPU, indexing into the owning VM's arena.
pub type VcpuId = u32;

/// Which hardware vendor (or test double) backs a `VirtExtension` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    IntelVmx,
    AmdSvm,
    Software,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    #[error("CPU lacks the required virtualization extension")]
    NotSupported,
    #[error("virtualization extension already enabled by another hypervisor instance")]
    Busy,
    #[error("vCPU {0} has no allocated control structure")]
    UnknownVcpu(VcpuId),
    #[error("control structure operation failed (vendor code {0:#x})")]
    ControlStructureFailure(u64),
    #[error("hardware double-fault on VM entry")]
    DoubleFaultOnEntry,
}

/// Per-VM configuration relevant to the HAL (CPUID policy lives in the
/// dispatcher above; this is strictly the control-structure-level config).
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub vcpu_count: u32,
    pub memory_size: u64,
}

/// Per-vCPU configuration used when allocating its control structure.
#[derive(Debug, Clone)]
pub struct VcpuConfig {
    pub id: VcpuId,
    pub initial_state: CpuState,
}

/// Uniform "create vCPU, load state, enter guest, receive exit" API over
/// Intel VMX and AMD SVM (§4.1). The HAL is the only place allowed to read
/// vendor-specific control-structure bits; everything above this trait
/// operates purely on the normalized [`ExitInfo`]/[`CpuState`] types.
pub trait VirtExtension {
    fn vendor(&self) -> Vendor;

    /// Enables the virt extension on the current CPU. Idempotent once
    /// enabled by this instance; fails if another instance holds it.
    fn enable(&mut self) -> Result<(), HalError>;

    fn disable(&mut self) -> Result<(), HalError>;

    /// Allocates and initializes a per-vCPU control structure (VMCS/VMCB):
    /// guest state from `config.initial_state`, host state captured from the
    /// calling thread, I/O and MSR permission bitmaps defaulting to
    /// "intercept everything configurable".
    fn create_vcpu(&mut self, config: VcpuConfig) -> Result<VcpuId, HalError>;

    fn destroy_vcpu(&mut self, vcpu: VcpuId) -> Result<(), HalError>;

    fn get_vcpu_state(&self, vcpu: VcpuId) -> Result<CpuState, HalError>;

    fn set_vcpu_state(&mut self, vcpu: VcpuId, state: &CpuState) -> Result<(), HalError>;

    /// Loads the control structure on the current CPU, transitions to guest,
    /// and returns only on VM-exit with a normalized `ExitInfo`. On AMD the
    /// implementation maps SVM exit codes to the Intel-equivalent reason
    /// space before returning.
    fn enter_guest(&mut self, vcpu: VcpuId) -> Result<ExitInfo, HalError>;

    /// Queues an interrupt or exception for delivery on the vCPU's next
    /// entry. Implementations must respect interrupt-shadow (no delivery
    /// immediately after MOV SS/STI) and NMI-blocking semantics.
    fn inject_event(&mut self, vcpu: VcpuId, event: InjectedEvent) -> Result<(), HalError>;

    /// True while an injected event is still pending delivery (interrupt
    /// shadow or an outstanding NMI block the next injection).
    fn interrupt_shadow(&self, vcpu: VcpuId) -> bool;

    /// Requests an interrupt-window exit the next time EFLAGS.IF is set,
    /// used by the dispatcher when a pending vector cannot be injected yet.
    fn request_interrupt_window(&mut self, vcpu: VcpuId) -> Result<(), HalError>;
}

static_assertions::assert_impl_all!(HalError: std::error::Error, Send, Sync);
