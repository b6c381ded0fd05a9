//! Top-level error aggregation, mirroring the shape of the teacher's
//! `ZerovisorError` in `zerovisor-core::lib` (one enum variant per
//! subsystem, each wrapping that subsystem's own error type).

use thiserror::Error;

use crate::iommu::IommuError;
use crate::memory::MemoryError;
use crate::migration::MigrationError;
use crate::recovery::RecoveryError;
use zerovisor_hal::virt_extension::HalError;

#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Hal(#[from] HalError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Iommu(#[from] IommuError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("invalid VM configuration: {0}")]
    InvalidConfig(String),
    #[error("vCPU {0} not found")]
    UnknownVcpu(u32),
}
