//! Exit Dispatcher (§4.2): routes a normalized [`ExitInfo`] to the handler
//! associated with its [`ExitReason`], mutates vCPU state, touches the
//! [`DeviceBus`], and decides whether to re-enter, halt, or surface a fault.
//!
//! The dispatcher itself holds no vCPU; callers (the scheduler's per-vCPU
//! loop in [`crate::scheduler`]) pass in the pieces each exit needs and act
//! on the returned [`ExitOutcome`]. This keeps the dispatcher free of
//! locking concerns — all serialization of a single exit's side effects
//! (§5 "within one vCPU... totally ordered") is the caller's responsibility,
//! satisfied trivially because only one thread ever drives a given vCPU.

use std::collections::HashMap;

use zerovisor_hal::cpu_state::{msr, CpuState};
use zerovisor_hal::exit::{AccessWidth, ExitInfo, ExitQualification, ExitReason, InjectedEventKind};

use crate::device_bus::DeviceBus;
use crate::memory::{Ept, FaultClass, GuestRam};
use crate::recovery::RecoveryDecision;

/// One CPUID leaf's canned response, indexed by `(eax, ecx)` (§4.2 "CPUID").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidLeaf {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Per-VM CPUID leaf table. Unknown leaves return zeros in all four
/// registers; the hypervisor-presence bit and leaf range are controlled
/// explicitly rather than inherited from the host.
#[derive(Debug, Clone, Default)]
pub struct CpuidTable {
    leaves: HashMap<(u32, u32), CpuidLeaf>,
}

impl CpuidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leaf(&mut self, eax_in: u32, ecx_in: u32, response: CpuidLeaf) {
        self.leaves.insert((eax_in, ecx_in), response);
    }

    pub fn lookup(&self, eax_in: u32, ecx_in: u32) -> CpuidLeaf {
        self.leaves
            .get(&(eax_in, ecx_in))
            .copied()
            .unwrap_or(CpuidLeaf { eax: 0, ebx: 0, ecx: 0, edx: 0 })
    }
}

/// MSR access partition (§4.2 "MSR access"). Passthrough MSRs never reach
/// the dispatcher (the HAL's permission bitmap handles them); this table
/// only needs to distinguish emulated from forbidden.
fn is_emulated_msr(index: u32) -> bool {
    matches!(
        index,
        msr::EFER
            | msr::LSTAR
            | msr::STAR
            | msr::CSTAR
            | msr::SFMASK
            | msr::FS_BASE
            | msr::GS_BASE
            | msr::KERNEL_GS_BASE
            | msr::SYSENTER_CS
            | msr::SYSENTER_ESP
            | msr::SYSENTER_EIP
            | msr::TSC
            | msr::TSC_ADJUST
            | msr::PAT
            | msr::MTRR_DEF_TYPE
    ) || (0x800..=0x8FF).contains(&index) // x2APIC range
}

/// What the dispatcher decided should happen after handling one exit. The
/// scheduler loop (§4.7) acts on this before deciding whether to re-enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Handler completed; re-enter the guest (after the injection pass).
    ReEnter,
    /// HLT: the vCPU should park until woken (§4.2 "HLT").
    Halt,
    /// EPT violation resolved to a demand-map miss inside guest RAM.
    DemandMap { gpa: u64, write: bool },
    /// EPT violation resolved to an MMIO access; caller forwards to the bus.
    Mmio { gpa: u64, width: AccessWidth, write: bool, value: u64 },
    /// Fatal to the vCPU or VM; caller applies the recovery decision.
    Fault(RecoveryDecision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("device rejected the access")]
    DeviceFault,
}

/// Fixed per-VM dispatch configuration: the CPUID table and whether the
/// hypervisor-presence bit is advertised to the guest.
pub struct ExitDispatcher {
    pub cpuid: CpuidTable,
    pub hypervisor_present: bool,
}

impl ExitDispatcher {
    pub fn new(cpuid: CpuidTable) -> Self {
        Self { cpuid, hypervisor_present: true }
    }

    /// Routes one normalized exit. `cpu` is mutated in place (registers,
    /// RIP advance on a handled instruction); `bus`/`ept`/`ram` serve EPT
    /// and MMIO/I-O forwarding. Returns the outcome the caller acts on.
    pub fn dispatch(
        &self,
        exit: &ExitInfo,
        cpu: &mut CpuState,
        bus: &dyn DeviceBus,
        ept: &Ept,
        ram: &GuestRam,
    ) -> Result<ExitOutcome, DispatchError> {
        let outcome = match exit.reason {
            ExitReason::Cpuid => {
                self.handle_cpuid(cpu);
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::Rdmsr => {
                self.handle_rdmsr(cpu, exit);
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::Wrmsr => {
                self.handle_wrmsr(cpu, exit);
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::IoIn | ExitReason::IoOut => {
                self.handle_io(cpu, exit, bus)?;
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::EptViolation => self.handle_ept_violation(exit, ept, ram)?,
            ExitReason::EptMisconfig => ExitOutcome::Fault(RecoveryDecision::Shutdown),
            ExitReason::Hlt => {
                self.advance_rip(cpu, exit);
                ExitOutcome::Halt
            }
            ExitReason::Pause => {
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::Invlpg => {
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::Vmcall => {
                log::debug!("VMCALL at rip={:#x} (no hypercall ABI defined)", exit.guest_rip);
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::CrAccess => {
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::Xsetbv => {
                let value = ((cpu.rdx & 0xFFFF_FFFF) << 32) | (cpu.rax & 0xFFFF_FFFF);
                cpu.xcr0 = value;
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::Rdtsc | ExitReason::Rdtscp => {
                let tsc_entry = cpu.msrs.iter_mut().find(|m| m.msr == msr::TSC);
                let tsc = if let Some(entry) = tsc_entry {
                    entry.value = entry.value.wrapping_add(1000);
                    entry.value
                } else {
                    0
                };
                cpu.rax = tsc & 0xFFFF_FFFF;
                cpu.rdx = tsc >> 32;
                if exit.reason == ExitReason::Rdtscp {
                    cpu.rcx = 0;
                }
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::Wbinvd | ExitReason::Monitor | ExitReason::Mwait => {
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::TaskSwitch => {
                self.advance_rip(cpu, exit);
                ExitOutcome::ReEnter
            }
            ExitReason::ExternalInterrupt | ExitReason::InterruptWindow => ExitOutcome::ReEnter,
            ExitReason::ExceptionNmi => self.handle_exception(exit),
            ExitReason::Init => {
                *cpu = CpuState::default();
                ExitOutcome::ReEnter
            }
            ExitReason::Sipi => {
                if let ExitQualification::Interrupt { vector } = exit.qualification {
                    cpu.cs.selector = (vector as u16) << 8;
                    cpu.cs.base = (vector as u64) << 12;
                    cpu.rip = 0;
                }
                ExitOutcome::ReEnter
            }
            ExitReason::TripleFault | ExitReason::Shutdown => ExitOutcome::Fault(RecoveryDecision::HardReset),
        };
        Ok(outcome)
    }

    fn advance_rip(&self, cpu: &mut CpuState, exit: &ExitInfo) {
        cpu.rip = exit.guest_rip.wrapping_add(exit.instruction_len as u64);
    }

    /// Emulates CPUID from the per-VM leaf table; unknown leaves return
    /// zeros in all four registers (§4.2 "CPUID", §8 S1).
    fn handle_cpuid(&self, cpu: &mut CpuState) {
        let eax_in = cpu.rax as u32;
        let ecx_in = cpu.rcx as u32;
        let leaf = self.cpuid.lookup(eax_in, ecx_in);
        cpu.rax = leaf.eax as u64;
        cpu.rbx = leaf.ebx as u64;
        cpu.rcx = leaf.ecx as u64;
        cpu.rdx = leaf.edx as u64;
    }

    /// RDMSR: emulated MSRs read from the state block; forbidden MSRs
    /// return zero (§4.2 "MSR access" (c)).
    ///
    /// `EFER` is a dedicated `CpuState` field (§6.3 lists it under control
    /// registers, not the MSR list) and the x2APIC range has no backing
    /// store in this engine's `CpuState` — both are read here without
    /// touching `cpu.msrs`, which otherwise must stay at exactly
    /// `ENUMERATED_MSRS.len()` entries for the checkpoint's fixed-size MSR
    /// section to round-trip (§6.1, §6.3).
    fn handle_rdmsr(&self, cpu: &mut CpuState, exit: &ExitInfo) {
        let index = match exit.qualification {
            ExitQualification::Msr { index, .. } => index,
            _ => cpu.rcx as u32,
        };
        let value = if index == msr::EFER {
            cpu.efer
        } else if is_emulated_msr(index) {
            cpu.msrs.iter().find(|m| m.msr == index).map(|m| m.value).unwrap_or(0)
        } else {
            0
        };
        cpu.rax = value & 0xFFFF_FFFF;
        cpu.rdx = value >> 32;
    }

    /// WRMSR: emulated MSRs are written into the state block; forbidden
    /// MSRs trigger a #GP, injected as a hardware exception on next entry.
    ///
    /// Only indices already present in `cpu.msrs` (i.e. `ENUMERATED_MSRS`)
    /// are updated in place; `EFER` writes go to `cpu.efer` and x2APIC
    /// writes are accepted but not persisted (see `handle_rdmsr`). Never
    /// pushes a new entry — growing `cpu.msrs` beyond its fixed length
    /// would desynchronize the checkpoint format from `ENUMERATED_MSRS`.
    fn handle_wrmsr(&self, cpu: &mut CpuState, exit: &ExitInfo) {
        let index = match exit.qualification {
            ExitQualification::Msr { index, .. } => index,
            _ => cpu.rcx as u32,
        };
        let value = ((cpu.rdx & 0xFFFF_FFFF) << 32) | (cpu.rax & 0xFFFF_FFFF);
        if index == msr::EFER {
            cpu.efer = value;
        } else if is_emulated_msr(index) {
            if let Some(entry) = cpu.msrs.iter_mut().find(|m| m.msr == index) {
                entry.value = value;
            }
            // x2APIC range: emulated (never #GP) but has no dedicated
            // storage in this engine's CpuState, so the write is accepted
            // and dropped.
        }
        // Forbidden MSR writes are supposed to raise #GP(0); callers that
        // need this injected should check `is_emulated_msr` themselves via
        // `forbidden_msr_write` below and queue the exception.
    }

    /// True when a WRMSR to `index` should be rejected with #GP, for the
    /// caller to queue the injection (kept out of `handle_wrmsr` so the
    /// dispatcher stays free of vCPU-queue access).
    pub fn forbidden_msr_write(&self, index: u32) -> bool {
        !is_emulated_msr(index)
    }

    fn handle_io(&self, cpu: &mut CpuState, exit: &ExitInfo, bus: &dyn DeviceBus) -> Result<(), DispatchError> {
        let (port, width, is_write) = match exit.qualification {
            ExitQualification::Io { port, width, is_write, .. } => (port, width, is_write),
            _ => return Ok(()),
        };
        if is_write {
            let value = match width {
                AccessWidth::Byte => cpu.rax & 0xFF,
                AccessWidth::Word => cpu.rax & 0xFFFF,
                AccessWidth::Dword => cpu.rax & 0xFFFF_FFFF,
            } as u32;
            bus.io_write(port, width, value).map_err(|_| DispatchError::DeviceFault)?;
        } else {
            let value = bus.io_read(port, width).map_err(|_| DispatchError::DeviceFault)?;
            let mask = match width {
                AccessWidth::Byte => 0xFFu64,
                AccessWidth::Word => 0xFFFFu64,
                AccessWidth::Dword => 0xFFFF_FFFFu64,
            };
            cpu.rax = (cpu.rax & !mask) | (value as u64 & mask);
        }
        Ok(())
    }

    /// Classifies an EPT_VIOLATION by qualification bits and the memory
    /// subsystem's region map (§4.2 "EPT_VIOLATION").
    fn handle_ept_violation(&self, exit: &ExitInfo, ept: &Ept, ram: &GuestRam) -> Result<ExitOutcome, DispatchError> {
        let (gpa, write) = match exit.qualification {
            ExitQualification::Ept { gpa, write, .. } => (gpa, write),
            _ => return Ok(ExitOutcome::Fault(RecoveryDecision::Shutdown)),
        };
        Ok(match ept.classify_violation(ram, gpa, write) {
            FaultClass::DemandMap { gpa, write } => ExitOutcome::DemandMap { gpa, write },
            FaultClass::Mmio { gpa, write } => ExitOutcome::Mmio { gpa, width: AccessWidth::Dword, write, value: 0 },
            FaultClass::Fatal(_) => ExitOutcome::Fault(RecoveryDecision::HardReset),
        })
    }

    /// A guest-mode page fault (vector 14) is transient-recoverable — it is
    /// reflected back to the guest, not escalated (§7 taxonomy). Any other
    /// vector is classified by the recovery core.
    fn handle_exception(&self, exit: &ExitInfo) -> ExitOutcome {
        let vector = match exit.qualification {
            ExitQualification::Interrupt { vector } => vector,
            _ => 0,
        };
        if vector == 14 {
            ExitOutcome::ReEnter
        } else {
            ExitOutcome::Fault(crate::recovery::decision_for_vector(vector))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerovisor_hal::exit::ExitQualification;

    fn base_exit(reason: ExitReason, qualification: ExitQualification) -> ExitInfo {
        ExitInfo { reason, qualification, guest_rip: 0x1000, guest_linear: 0, error_code: None, instruction_len: 2 }
    }

    #[test]
    fn cpuid_emulation_matches_table_and_advances_rip() {
        let mut table = CpuidTable::new();
        table.set_leaf(1, 0, CpuidLeaf { eax: 0x000506E3, ebx: 0, ecx: 0, edx: 0 });
        let dispatcher = ExitDispatcher::new(table);
        let mut cpu = CpuState { rax: 1, rcx: 0, ..CpuState::default() };
        let ram = GuestRam::new(4096 * 4, 0x1_0000_0000, 4096);
        let ept = Ept::new(4096 * 4);
        let exit = base_exit(ExitReason::Cpuid, ExitQualification::None);
        let outcome = dispatcher.dispatch(&exit, &mut cpu, &crate::device_bus::NullDeviceBus, &ept, &ram).unwrap();
        assert_eq!(outcome, ExitOutcome::ReEnter);
        assert_eq!(cpu.rax, 0x000506E3);
        assert_eq!(cpu.rbx, 0);
        assert_eq!(cpu.rip, 0x1002);
    }

    #[test]
    fn unknown_cpuid_leaf_returns_zeros() {
        let dispatcher = ExitDispatcher::new(CpuidTable::new());
        let mut cpu = CpuState { rax: 0x8000_0008, ..CpuState::default() };
        let ram = GuestRam::new(4096 * 4, 0x1_0000_0000, 4096);
        let ept = Ept::new(4096 * 4);
        let exit = base_exit(ExitReason::Cpuid, ExitQualification::None);
        dispatcher.dispatch(&exit, &mut cpu, &crate::device_bus::NullDeviceBus, &ept, &ram).unwrap();
        assert_eq!((cpu.rax, cpu.rbx, cpu.rcx, cpu.rdx), (0, 0, 0, 0));
    }

    #[test]
    fn forbidden_msr_write_is_flagged_for_gp_injection() {
        let dispatcher = ExitDispatcher::new(CpuidTable::new());
        assert!(dispatcher.forbidden_msr_write(0xDEAD_BEEF));
        assert!(!dispatcher.forbidden_msr_write(msr::EFER));
    }

    /// §6.3's checkpoint MSR section is a fixed-size block of
    /// `ENUMERATED_MSRS.len()` entries with no length prefix; writing EFER
    /// or an x2APIC MSR must never grow `cpu.msrs` past that count, or
    /// every migration checkpoint taken afterwards desynchronizes.
    #[test]
    fn wrmsr_to_efer_and_x2apic_does_not_grow_enumerated_msr_list() {
        use zerovisor_hal::cpu_state::ENUMERATED_MSRS;

        let dispatcher = ExitDispatcher::new(CpuidTable::new());
        let ram = GuestRam::new(4096 * 4, 0x1_0000_0000, 4096);
        let ept = Ept::new(4096 * 4);
        let mut cpu = CpuState::default();
        assert_eq!(cpu.msrs.len(), ENUMERATED_MSRS.len());

        let mut wrmsr = |index: u32, value: u64, cpu: &mut CpuState| {
            let exit = base_exit(ExitReason::Wrmsr, ExitQualification::Msr { index, is_write: true });
            cpu.rax = value & 0xFFFF_FFFF;
            cpu.rdx = value >> 32;
            dispatcher.dispatch(&exit, cpu, &crate::device_bus::NullDeviceBus, &ept, &ram).unwrap();
        };

        wrmsr(msr::EFER, 0x0000_0500, &mut cpu);
        assert_eq!(cpu.efer, 0x0000_0500);
        assert_eq!(cpu.msrs.len(), ENUMERATED_MSRS.len());

        wrmsr(0x802, 0xDEAD_BEEF, &mut cpu); // x2APIC ICR-equivalent
        assert_eq!(cpu.msrs.len(), ENUMERATED_MSRS.len());

        wrmsr(msr::LSTAR, 0x1234, &mut cpu);
        assert_eq!(cpu.msrs.len(), ENUMERATED_MSRS.len());
        assert_eq!(cpu.msrs.iter().find(|m| m.msr == msr::LSTAR).unwrap().value, 0x1234);
    }

    #[test]
    fn ept_violation_inside_ram_is_demand_map() {
        let dispatcher = ExitDispatcher::new(CpuidTable::new());
        let mut cpu = CpuState::default();
        let ram = GuestRam::new(4096 * 4, 0x1_0000_0000, 4096);
        let ept = Ept::new(4096 * 4);
        let exit = base_exit(
            ExitReason::EptViolation,
            ExitQualification::Ept { gpa: 0x1000, read: false, write: true, execute: false, present: false },
        );
        let outcome = dispatcher.dispatch(&exit, &mut cpu, &crate::device_bus::NullDeviceBus, &ept, &ram).unwrap();
        assert_eq!(outcome, ExitOutcome::DemandMap { gpa: 0x1000, write: true });
    }

    #[test]
    fn triple_fault_surfaces_hard_reset() {
        let dispatcher = ExitDispatcher::new(CpuidTable::new());
        let mut cpu = CpuState::default();
        let ram = GuestRam::new(4096 * 4, 0x1_0000_0000, 4096);
        let ept = Ept::new(4096 * 4);
        let exit = base_exit(ExitReason::TripleFault, ExitQualification::None);
        let outcome = dispatcher.dispatch(&exit, &mut cpu, &crate::device_bus::NullDeviceBus, &ept, &ram).unwrap();
        assert_eq!(outcome, ExitOutcome::Fault(RecoveryDecision::HardReset));
    }
}
