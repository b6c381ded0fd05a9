//! The `VirtualMachine` aggregate (§3 "VirtualMachine"): owns guest RAM, the
//! vCPU set, the EPT, the optional IOMMU, the device bus, the recovery
//! core, and drives the per-vCPU exit loop (§4.2) under the scheduler's
//! phase model (§4.7).
//!
//! Grounded in the teacher's `vm.rs` VM-lifecycle shape (`VmState`,
//! config validation, a registry owning per-VM resources) but expressed as
//! an owned aggregate object rather than a global `BTreeMap` registry
//! behind a `static Mutex` — this crate's other subsystems (`Ept`,
//! `RecoveryManager`, `IommuController`) are already instance-based, and the
//! spec itself describes "a VirtualMachine" as a value the embedder holds,
//! not a handle into process-wide state (see DESIGN.md).
//!
//! **HAL concurrency note (expansion):** true concurrent guest entry needs
//! one physical core's control structure per vCPU; this crate's
//! `VirtExtension` backends model a single shared instance per VM rather
//! than per-core state, so `hal` is `Mutex`-protected and guest entry is
//! serialized across vCPUs at the instant of `enter_guest`/`get_vcpu_state`/
//! `set_vcpu_state`. Everything else the spec requires lock-free or
//! independently concurrent — pending-interrupt queues, halt/park, phase
//! transitions, the dirty bitmap, IOMMU fault counters — remains so; only
//! the HAL call itself is serialized, and never while a vCPU is parked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use zerovisor_hal::addr::is_page_aligned;
use zerovisor_hal::virt_extension::{HalError, VcpuConfig, VcpuId, VirtExtension};

use crate::device_bus::DeviceBus;
use crate::dispatcher::{CpuidTable, ExitDispatcher, ExitOutcome};
use crate::error::VmError;
use crate::iommu::{Bdf, IommuController};
use crate::memory::{Ept, GuestRam};
use crate::migration::{MigrationConfig, MigrationSession};
use crate::recovery::{kind_for_vector, RecoveryConfig, RecoveryDecision, RecoveryManager};
use crate::scheduler::{self, LoopAction, Phase, Scheduler, SharedPhase};
use crate::vcpu::{ExecutionState, Vcpu};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub vcpu_count: u32,
    pub memory_size: u64,
    pub mmio_base: u64,
    pub mmio_len: u64,
    pub iommu_remap_table_size: Option<usize>,
}

fn validate_config(config: &VmConfig) -> Result<(), VmError> {
    if config.vcpu_count == 0 {
        return Err(VmError::InvalidConfig("vcpu_count must be nonzero".into()));
    }
    if !is_page_aligned(config.memory_size) {
        return Err(VmError::InvalidConfig("memory_size must be 4 KiB aligned".into()));
    }
    Ok(())
}

/// The VM aggregate. Generic over the HAL backend so the same code runs
/// against `VmxBackend`, `SvmBackend`, or `SoftBackend` in tests (§9
/// testability note).
pub struct VirtualMachine<V: VirtExtension> {
    hal: Mutex<V>,
    pub ram: GuestRam,
    pub ept: Ept,
    pub vcpus: Vec<Vcpu>,
    dispatcher: ExitDispatcher,
    bus: Box<dyn DeviceBus>,
    pub recovery: RecoveryManager,
    pub iommu: Option<IommuController>,
    phase: Arc<SharedPhase>,
    pause_gate: (Mutex<()>, Condvar),
    stop_requested: AtomicBool,
    /// How often the watchdog thread polls every vCPU's
    /// `time_since_last_exit` against `recovery`'s deadline (§4.6). Set to a
    /// fraction of the configured watchdog timeout so expiry is caught
    /// promptly without busy-polling.
    watchdog_poll_interval: Duration,
}

impl<V: VirtExtension> VirtualMachine<V> {
    pub fn new(
        mut hal: V,
        config: VmConfig,
        bus: Box<dyn DeviceBus>,
        cpuid: CpuidTable,
        recovery_config: RecoveryConfig,
    ) -> Result<Self, VmError> {
        validate_config(&config)?;
        hal.enable()?;

        let ram = GuestRam::new(config.memory_size, config.mmio_base, config.mmio_len);
        let ept = Ept::new(config.memory_size);
        let mut vcpus = Vec::with_capacity(config.vcpu_count as usize);
        for id in 0..config.vcpu_count {
            let assigned = hal.create_vcpu(VcpuConfig { id, initial_state: Default::default() })?;
            vcpus.push(Vcpu::new(assigned));
        }
        let iommu = config.iommu_remap_table_size.map(IommuController::new);
        let watchdog_poll_interval = (recovery_config.watchdog_timeout / 10).max(Duration::from_millis(1));

        Ok(Self {
            hal: Mutex::new(hal),
            ram,
            ept,
            vcpus,
            dispatcher: ExitDispatcher::new(cpuid),
            bus,
            recovery: RecoveryManager::new(recovery_config)?,
            iommu,
            phase: Arc::new(SharedPhase::new()),
            pause_gate: (Mutex::new(()), Condvar::new()),
            stop_requested: AtomicBool::new(false),
            watchdog_poll_interval,
        })
    }

    fn notify_phase(&self, phase: Phase) {
        self.phase.set(phase);
        let _guard = self.pause_gate.0.lock().unwrap();
        self.pause_gate.1.notify_all();
    }

    pub fn pause(&self) {
        self.notify_phase(Phase::Pausing);
    }

    pub fn resume(&self) {
        self.notify_phase(Phase::Running);
        for vcpu in &self.vcpus {
            if vcpu.state() == ExecutionState::Paused {
                vcpu.set_state(ExecutionState::Running);
            }
        }
    }

    fn wait_while_paused(&self) {
        let guard = self.pause_gate.0.lock().unwrap();
        let _unused = self
            .pause_gate
            .1
            .wait_while(guard, |_| matches!(self.phase.get(), Phase::Pausing | Phase::Paused))
            .unwrap();
    }

    /// Spawns one OS thread per vCPU (§4.7) and returns the handle used to
    /// pause/resume/stop them. `self` must already be wrapped in an `Arc`
    /// since each thread holds a clone for the duration of its run loop.
    pub fn spawn_scheduler(self: &Arc<Self>) -> Scheduler
    where
        V: Send + 'static,
    {
        let mut scheduler = Scheduler::new(Arc::clone(&self.phase));
        for index in 0..self.vcpus.len() {
            let vm = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("vcpu-{index}"))
                .spawn(move || vm.run_vcpu_loop(index))
                .expect("spawning a vCPU thread");
            scheduler.register(handle);
        }
        let watchdog_vm = Arc::clone(self);
        let watchdog_handle = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || watchdog_vm.run_watchdog_loop())
            .expect("spawning the watchdog thread");
        scheduler.register(watchdog_handle);
        scheduler
    }

    /// Polls every vCPU's elapsed time since its last exit against
    /// `recovery`'s deadline (§4.6 "Watchdog", §8 invariant 8, §8 S6).
    /// A vCPU parked in `Halted`/`Paused` makes forward progress by
    /// definition (it is waiting on an event, not stuck mid-handler), so
    /// only `Running` vCPUs are checked. Exits the loop once the VM is
    /// stopping, same cancellation contract as the per-vCPU threads (§4.7).
    fn run_watchdog_loop(self: Arc<Self>) {
        loop {
            match self.phase.get() {
                Phase::Stopping | Phase::Stopped => break,
                _ => {}
            }
            for vcpu in &self.vcpus {
                if vcpu.state() == ExecutionState::Running
                    && self.recovery.watchdog_expired(vcpu.time_since_last_exit())
                {
                    let decision = self.recovery.classify_and_decide(
                        crate::recovery::ExceptionKind::WatchdogTimeout,
                        0,
                        0,
                        None,
                    );
                    log::error!("vcpu {}: watchdog timeout, escalating to {:?}", vcpu.id, decision);
                    self.apply_recovery_decision(vcpu.id, vcpu, decision);
                }
            }
            thread::sleep(self.watchdog_poll_interval);
        }
    }

    /// One vCPU's execution thread body (§4.2 exit loop, §4.7 phase check).
    fn run_vcpu_loop(self: Arc<Self>, index: usize) {
        let vcpu = &self.vcpus[index];
        let id = vcpu.id;
        loop {
            match scheduler::next_action(self.phase.get(), vcpu) {
                LoopAction::Exit => break,
                LoopAction::ParkForPause => {
                    self.wait_while_paused();
                    continue;
                }
                LoopAction::ReEnter => {}
            }
            if let Err(err) = self.step_vcpu(id, vcpu) {
                log::error!("vcpu {id}: {err}");
                break;
            }
            if vcpu.state() == ExecutionState::Halted {
                vcpu.park_while_halted();
                if self.phase.get() == Phase::Running {
                    vcpu.set_state(ExecutionState::Running);
                }
            }
        }
    }

    /// Runs one enter-guest/dispatch/apply cycle for `vcpu` (§4.2).
    fn step_vcpu(&self, id: VcpuId, vcpu: &Vcpu) -> Result<(), VmError> {
        let exit = self.hal.lock().unwrap().enter_guest(id)?;
        vcpu.record_exit();
        vcpu.set_interrupt_shadow(self.hal.lock().unwrap().interrupt_shadow(id));

        let mut state = self.hal.lock().unwrap().get_vcpu_state(id)?;
        let outcome = self
            .dispatcher
            .dispatch(&exit, &mut state, self.bus.as_ref(), &self.ept, &self.ram)
            .map_err(|_| VmError::InvalidConfig(format!("device fault on vcpu {id}")))?;

        match outcome {
            ExitOutcome::ReEnter => {}
            ExitOutcome::Halt => vcpu.set_state(ExecutionState::Halted),
            ExitOutcome::DemandMap { gpa, write } => {
                // Identity-mapped: HPA is the same offset into `self.ram`'s
                // arena as the GPA, since this VM has no separate host
                // physical allocator backing guest memory.
                let page_gpa = gpa & !(zerovisor_hal::addr::PAGE_SIZE - 1);
                self.ept.demand_map_zero_page(page_gpa, page_gpa)?;
                if write {
                    self.ept.mark_dirty(page_gpa);
                }
            }
            ExitOutcome::Mmio { gpa, width, write, .. } => {
                if write {
                    let mask: u64 = if width.bytes() >= 4 { 0xFFFF_FFFF } else { (1u64 << (width.bytes() * 8)) - 1 };
                    let _ = self.bus.mmio_write(gpa, width, state.rax & mask);
                } else if let Ok(value) = self.bus.mmio_read(gpa, width) {
                    state.rax = value;
                }
            }
            ExitOutcome::Fault(decision) => {
                // The recovery decision owns any state mutation for this
                // vCPU (reset, hard reset, fault); writing back the
                // pre-fault `state` snapshot below would clobber it.
                self.apply_recovery_decision(id, vcpu, decision);
                return Ok(());
            }
        }

        self.inject_pending_interrupt(id, vcpu, &state)?;
        self.hal.lock().unwrap().set_vcpu_state(id, &state)?;
        Ok(())
    }

    fn inject_pending_interrupt(&self, id: VcpuId, vcpu: &Vcpu, state: &zerovisor_hal::cpu_state::CpuState) -> Result<(), HalError> {
        let if_set = state.rflags & (1 << 9) != 0;
        if let Some(event) = vcpu.take_next_injectable(if_set) {
            let mut hal = self.hal.lock().unwrap();
            hal.inject_event(id, event)?;
        } else if vcpu.has_pending_interrupt() {
            self.hal.lock().unwrap().request_interrupt_window(id)?;
        }
        Ok(())
    }

    /// Applies a recovery decision surfaced by a faulting exit (§4.6).
    /// Concrete device reset/restore is delegated to the `DeviceBus`
    /// implementation (external, §1 Non-goals); this just routes the
    /// decision and logs it.
    fn apply_recovery_decision(&self, id: VcpuId, vcpu: &Vcpu, decision: RecoveryDecision) {
        match decision {
            RecoveryDecision::Ignore => {}
            RecoveryDecision::ResetVCpu(_) => {
                let default_state = zerovisor_hal::cpu_state::CpuState::default();
                if let Err(err) = self.hal.lock().unwrap().set_vcpu_state(id, &default_state) {
                    log::error!("vcpu {id}: reset failed: {err}");
                }
                vcpu.set_state(ExecutionState::Running);
            }
            RecoveryDecision::ResetDevice(device_id) => {
                log::warn!("vcpu {id}: device {device_id:#06x} reset requested (delegated to DeviceBus owner)");
            }
            RecoveryDecision::HardReset => {
                for other in &self.vcpus {
                    other.set_state(ExecutionState::Faulted);
                }
                let default_state = zerovisor_hal::cpu_state::CpuState::default();
                for other in &self.vcpus {
                    if self.hal.lock().unwrap().set_vcpu_state(other.id, &default_state).is_ok() {
                        other.set_state(ExecutionState::Running);
                    }
                }
            }
            RecoveryDecision::PauseVm => self.pause(),
            RecoveryDecision::RestoreSnapshot(generation) => {
                log::warn!("vcpu {id}: restore-to-snapshot generation {generation} requested (no local snapshot store)");
                vcpu.set_state(ExecutionState::Faulted);
            }
            RecoveryDecision::IsolateDevice(bdf) => {
                if let Some(iommu) = &self.iommu {
                    let _ = iommu.detach_device(bdf as Bdf);
                }
            }
            RecoveryDecision::Shutdown => {
                vcpu.set_state(ExecutionState::Faulted);
                self.stop_requested.store(true, Ordering::Release);
                self.notify_phase(Phase::Stopping);
            }
        }
    }

    /// Surfaces an `ExceptionNmi` exit's vector through the recovery core
    /// with full retry/escalation bookkeeping, for callers that want the
    /// stateful path instead of the dispatcher's stateless default (used by
    /// embedders layering their own policy above §4.6's table).
    pub fn classify_exception(&self, vector: u8, guest_rip: u64, cr3: u64) -> RecoveryDecision {
        self.recovery.classify_and_decide(kind_for_vector(vector), guest_rip, cr3, None)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Opens a live-migration session against this VM's own memory, EPT,
    /// HAL, and device bus (§4.5). Requires exclusive access since precopy
    /// reads `hal`'s vCPU state directly rather than through the per-step
    /// `Mutex` serialization the exit loop uses; callers pause the VM first
    /// (`pause()` + waiting for every vCPU to reach `Paused`) so no exit
    /// loop thread is mutating state concurrently.
    pub fn migrate_out(&mut self, config: MigrationConfig) -> MigrationSession<'_, V> {
        let vcpu_ids = self.vcpus.iter().map(|v| v.id).collect();
        MigrationSession::new(
            &self.ram,
            &self.ept,
            self.hal.get_mut().unwrap(),
            vcpu_ids,
            self.bus.as_ref(),
            config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerovisor_hal::arch::soft::SoftBackend;
    use zerovisor_hal::exit::{ExitInfo, ExitQualification, ExitReason};

    fn test_vm() -> Arc<VirtualMachine<SoftBackend>> {
        let hal = SoftBackend::new();
        let config = VmConfig {
            vcpu_count: 1,
            memory_size: 4096 * 16,
            mmio_base: 0x1_0000_0000,
            mmio_len: 4096,
            iommu_remap_table_size: Some(256),
        };
        Arc::new(
            VirtualMachine::new(
                hal,
                config,
                Box::new(crate::device_bus::NullDeviceBus),
                CpuidTable::new(),
                RecoveryConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn new_vm_creates_one_vcpu_per_config() {
        let vm = test_vm();
        assert_eq!(vm.vcpus.len(), 1);
    }

    #[test]
    fn cpuid_exit_reenters_without_changing_vcpu_state() {
        let vm = test_vm();
        {
            let mut hal = vm.hal.lock().unwrap();
            hal.push_exit(0, ExitInfo {
                reason: ExitReason::Cpuid,
                qualification: ExitQualification::None,
                guest_rip: 0x1000,
                guest_linear: 0,
                error_code: None,
                instruction_len: 2,
            });
        }
        vm.step_vcpu(0, &vm.vcpus[0]).unwrap();
        assert_eq!(vm.vcpus[0].state(), ExecutionState::Running);
    }

    #[test]
    fn hlt_exit_parks_vcpu_in_halted_state() {
        let vm = test_vm();
        {
            let mut hal = vm.hal.lock().unwrap();
            hal.push_exit(0, ExitInfo {
                reason: ExitReason::Hlt,
                qualification: ExitQualification::None,
                guest_rip: 0x1000,
                guest_linear: 0,
                error_code: None,
                instruction_len: 1,
            });
        }
        vm.step_vcpu(0, &vm.vcpus[0]).unwrap();
        assert_eq!(vm.vcpus[0].state(), ExecutionState::Halted);
    }

    #[test]
    fn triple_fault_applies_hard_reset_and_keeps_vcpu_running() {
        let vm = test_vm();
        {
            let mut hal = vm.hal.lock().unwrap();
            hal.push_exit(0, ExitInfo {
                reason: ExitReason::TripleFault,
                qualification: ExitQualification::None,
                guest_rip: 0x1000,
                guest_linear: 0,
                error_code: None,
                instruction_len: 0,
            });
        }
        vm.step_vcpu(0, &vm.vcpus[0]).unwrap();
        assert_eq!(vm.vcpus[0].state(), ExecutionState::Running);
    }

    #[test]
    fn pause_then_resume_round_trips_phase() {
        let vm = test_vm();
        vm.pause();
        assert_eq!(vm.phase.get(), Phase::Pausing);
        vm.resume();
        assert_eq!(vm.phase.get(), Phase::Running);
    }

    /// §8 S6: a vCPU that never exits is paused within
    /// `watchdog_timeout_ms + ε`. The soft backend never produces a queued
    /// exit here, so the vCPU thread blocks forever inside `enter_guest`
    /// (simulating the "stuck handler" scenario) while the watchdog thread
    /// independently detects the stall from `time_since_last_exit`.
    #[test]
    fn watchdog_escalates_to_pause_on_stalled_vcpu() {
        let hal = SoftBackend::new();
        let config = VmConfig {
            vcpu_count: 1,
            memory_size: 4096 * 16,
            mmio_base: 0x1_0000_0000,
            mmio_len: 4096,
            iommu_remap_table_size: None,
        };
        let recovery_config = RecoveryConfig {
            watchdog_timeout: std::time::Duration::from_millis(20),
            ..RecoveryConfig::default()
        };
        let vm = Arc::new(
            VirtualMachine::new(hal, config, Box::new(crate::device_bus::NullDeviceBus), CpuidTable::new(), recovery_config)
                .unwrap(),
        );
        let watchdog_vm = Arc::clone(&vm);
        let handle = thread::spawn(move || watchdog_vm.run_watchdog_loop());

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(matches!(vm.phase.get(), Phase::Pausing | Phase::Paused));
        assert!(vm
            .recovery
            .ring_snapshot()
            .iter()
            .any(|ctx| ctx.kind == crate::recovery::ExceptionKind::WatchdogTimeout));

        vm.notify_phase(Phase::Stopping);
        handle.join().unwrap();
    }
}
