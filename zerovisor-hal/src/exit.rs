//! Normalized VM-exit reasons and injectable events.
//!
//! A single [`ExitReason`] enum spans both Intel VMX and AMD SVM; the HAL is
//! the only place allowed to read vendor-specific exit codes, translating
//! them into this shared space before they reach the dispatcher.

use crate::addr::GuestPhysicalAddress;

pub type InterruptVector = u8;

/// Normalized VM-exit reason, shared across VMX and SVM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    Cpuid,
    Rdmsr,
    Wrmsr,
    IoIn,
    IoOut,
    EptViolation,
    EptMisconfig,
    Hlt,
    Pause,
    ExternalInterrupt,
    InterruptWindow,
    ExceptionNmi,
    CrAccess,
    Invlpg,
    Vmcall,
    TripleFault,
    Init,
    Sipi,
    Shutdown,
    TaskSwitch,
    Wbinvd,
    Monitor,
    Mwait,
    Xsetbv,
    Rdtsc,
    Rdtscp,
}

/// Access width for an emulated I/O port or MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl AccessWidth {
    pub const fn bytes(self) -> u32 {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
        }
    }
}

/// Exit-reason-specific detail, analogous to the VMX exit qualification /
/// SVM exit info fields, already normalized to a vendor-neutral shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitQualification {
    None,
    Io { port: u16, width: AccessWidth, is_write: bool, string: bool },
    Ept { gpa: GuestPhysicalAddress, read: bool, write: bool, execute: bool, present: bool },
    CrAccess { cr: u8, gpr: u8, is_write: bool },
    Cr8Access { is_write: bool },
    Msr { index: u32, is_write: bool },
    Interrupt { vector: InterruptVector },
}

/// A normalized VM-exit, returned by [`crate::virt_extension::VirtExtension::enter_guest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub reason: ExitReason,
    pub qualification: ExitQualification,
    pub guest_rip: u64,
    pub guest_linear: u64,
    pub error_code: Option<u32>,
    pub instruction_len: u8,
}

/// An interrupt or exception queued for delivery on the vCPU's next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedEvent {
    pub vector: InterruptVector,
    pub kind: InjectedEventKind,
    pub error_code: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedEventKind {
    ExternalInterrupt,
    Nmi,
    HardwareException,
    SoftwareInterrupt,
}
