//! The `DeviceBus` contract (§6.2): the single narrow capability the exit
//! dispatcher uses to reach concrete device emulators. Concrete devices
//! (PIC, PIT, UART, AHCI, NIC, TPM, ACPI) are external collaborators and out
//! of scope here; this module defines only the trait and a minimal
//! in-tree `NullDeviceBus` so the dispatcher and its tests run standalone.

use zerovisor_hal::addr::GuestPhysicalAddress;
use zerovisor_hal::exit::AccessWidth;

/// A fault surfaced by a device access, distinct from a memory-subsystem
/// fault: the device itself rejected the access (bad port, bad width).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFault {
    pub reason: &'static str,
}

/// The narrow capability set every pluggable device exposes (§9 "Dynamic
/// dispatch for pluggable devices" — the one place virtual dispatch is
/// justified in this engine).
pub trait DeviceBus: Send + Sync {
    fn io_read(&self, port: u16, width: AccessWidth) -> Result<u32, DeviceFault>;
    fn io_write(&self, port: u16, width: AccessWidth, value: u32) -> Result<(), DeviceFault>;

    fn mmio_read(&self, gpa: GuestPhysicalAddress, width: AccessWidth) -> Result<u64, DeviceFault>;
    fn mmio_write(&self, gpa: GuestPhysicalAddress, width: AccessWidth, value: u64) -> Result<(), DeviceFault>;

    /// Level-sensitive IRQ signalling into the (external) interrupt
    /// controller device.
    fn raise_irq(&self, line: u8);
    fn lower_irq(&self, line: u8);

    /// Serializes all device state for the migration checkpoint (§6.1).
    fn snapshot(&self) -> Vec<u8>;
    /// Restores device state from a previous `snapshot()`.
    fn restore(&self, data: &[u8]) -> Result<(), DeviceFault>;
}

/// A `DeviceBus` that ignores every I/O and MMIO access and never raises an
/// IRQ, used so the dispatcher and its tests are runnable without a real
/// device model attached.
#[derive(Debug, Default)]
pub struct NullDeviceBus;

impl DeviceBus for NullDeviceBus {
    fn io_read(&self, _port: u16, _width: AccessWidth) -> Result<u32, DeviceFault> {
        Ok(0)
    }

    fn io_write(&self, _port: u16, _width: AccessWidth, _value: u32) -> Result<(), DeviceFault> {
        Ok(())
    }

    fn mmio_read(&self, _gpa: GuestPhysicalAddress, _width: AccessWidth) -> Result<u64, DeviceFault> {
        Ok(0)
    }

    fn mmio_write(&self, _gpa: GuestPhysicalAddress, _width: AccessWidth, _value: u64) -> Result<(), DeviceFault> {
        Ok(())
    }

    fn raise_irq(&self, _line: u8) {}
    fn lower_irq(&self, _line: u8) {}

    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore(&self, _data: &[u8]) -> Result<(), DeviceFault> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_bus_reads_zero_and_accepts_writes() {
        let bus = NullDeviceBus;
        assert_eq!(bus.io_read(0x3F8, AccessWidth::Byte).unwrap(), 0);
        assert!(bus.io_write(0x3F8, AccessWidth::Byte, 0x41).is_ok());
        assert!(bus.snapshot().is_empty());
        assert!(bus.restore(&[]).is_ok());
    }
}
