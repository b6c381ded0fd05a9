//! Core virtualization engine: the exit dispatcher, the two-dimensional
//! memory subsystem, the IOMMU pass-through layer, the live migration
//! engine, the error/recovery core, the vCPU scheduler, and the
//! `VirtualMachine` aggregate that ties them together over the
//! `zerovisor-hal` trait seam.

pub mod device_bus;
pub mod dispatcher;
pub mod error;
pub mod iommu;
pub mod memory;
pub mod migration;
pub mod recovery;
pub mod scheduler;
pub mod vcpu;
pub mod vm;

pub use device_bus::{DeviceBus, DeviceFault, NullDeviceBus};
pub use dispatcher::{CpuidLeaf, CpuidTable, DispatchError, ExitDispatcher, ExitOutcome};
pub use error::VmError;
pub use iommu::{Bdf, DomainId, IommuController, IommuError, Isolation};
pub use memory::{DirtyBitmap, Ept, FaultClass, GuestRam, MemoryError};
pub use migration::{Checkpoint, MigrationConfig, MigrationError, MigrationSession, ResumeMode};
pub use recovery::{ExceptionKind, RecoveryConfig, RecoveryDecision, RecoveryManager};
pub use scheduler::{Phase, Scheduler, SharedPhase};
pub use vcpu::{ExecutionState, Vcpu, VcpuCounters};
pub use vm::{VirtualMachine, VmConfig};
