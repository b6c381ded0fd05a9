//! Checkpoint wire format (§6.1): a self-describing byte stream covering
//! guest memory, per-vCPU register state, and per-device snapshots, closed
//! off with a SHA-256 integrity trailer.
//!
//! Field order and widths follow the offset table exactly, with one
//! necessary addition: the memory section is prefixed with its own byte
//! length so a reader can skip straight to the vCPU section without having
//! to chunk-scan it. Everything else is exactly as specified.

use sha2::{Digest, Sha256};
use zerovisor_hal::cpu_state::{CpuState, MsrEntry, SegmentRegister, ENUMERATED_MSRS};

use super::MigrationError;

pub const MAGIC: [u8; 4] = *b"NYXM";
pub const VERSION: u16 = 1;

const TRAILER_LEN: usize = 32;

/// One page-sized (or smaller, for the final run of a region) memory chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryChunk {
    pub gpa: u64,
    pub bytes: Vec<u8>,
}

/// One device's opaque snapshot blob (§6.2 `DeviceBus::snapshot`).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChunk {
    pub device_id: u16,
    pub bytes: Vec<u8>,
}

/// Everything a checkpoint carries, already assembled in memory. Built by
/// the stop-and-copy phase, consumed by `restore`.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub flags: u16,
    pub timestamp_ns: u64,
    pub memory: Vec<MemoryChunk>,
    pub vcpus: Vec<CpuState>,
    pub devices: Vec<DeviceChunk>,
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], MigrationError> {
    if buf.len() < n {
        return Err(MigrationError::Truncated);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, MigrationError> {
    Ok(u16::from_le_bytes(take(buf, 2)?.try_into().unwrap()))
}
fn take_u32(buf: &mut &[u8]) -> Result<u32, MigrationError> {
    Ok(u32::from_le_bytes(take(buf, 4)?.try_into().unwrap()))
}
fn take_u64(buf: &mut &[u8]) -> Result<u64, MigrationError> {
    Ok(u64::from_le_bytes(take(buf, 8)?.try_into().unwrap()))
}

fn serialize_segment(out: &mut Vec<u8>, seg: &SegmentRegister) {
    put_u16(out, seg.selector);
    put_u64(out, seg.base);
    put_u32(out, seg.limit);
    put_u32(out, seg.ar_bytes);
}

fn deserialize_segment(buf: &mut &[u8]) -> Result<SegmentRegister, MigrationError> {
    let selector = take_u16(buf)?;
    let base = take_u64(buf)?;
    let limit = take_u32(buf)?;
    let ar_bytes = take_u32(buf)?;
    Ok(SegmentRegister { selector, base, limit, ar_bytes })
}

/// Serializes one vCPU's full register snapshot (§6.3): general registers,
/// segments, control registers, then the explicitly enumerated MSR list, in
/// that fixed order. The block size is constant because `ENUMERATED_MSRS`
/// has a fixed length, so no internal framing is needed.
fn serialize_cpu_state(out: &mut Vec<u8>, state: &CpuState) {
    for reg in [
        state.rax, state.rbx, state.rcx, state.rdx, state.rsi, state.rdi, state.rbp, state.rsp,
        state.r8, state.r9, state.r10, state.r11, state.r12, state.r13, state.r14, state.r15,
        state.rip, state.rflags,
    ] {
        put_u64(out, reg);
    }
    for seg in [&state.cs, &state.ds, &state.es, &state.fs, &state.gs, &state.ss, &state.ldtr, &state.tr] {
        serialize_segment(out, seg);
    }
    for reg in [state.cr0, state.cr2, state.cr3, state.cr4, state.cr8, state.efer, state.xcr0] {
        put_u64(out, reg);
    }
    for entry in &state.msrs {
        put_u32(out, entry.msr);
        put_u64(out, entry.value);
    }
    out.extend_from_slice(state.fpu_state.as_ref());
}

fn deserialize_cpu_state(buf: &mut &[u8]) -> Result<CpuState, MigrationError> {
    let mut state = CpuState::default();
    state.rax = take_u64(buf)?;
    state.rbx = take_u64(buf)?;
    state.rcx = take_u64(buf)?;
    state.rdx = take_u64(buf)?;
    state.rsi = take_u64(buf)?;
    state.rdi = take_u64(buf)?;
    state.rbp = take_u64(buf)?;
    state.rsp = take_u64(buf)?;
    state.r8 = take_u64(buf)?;
    state.r9 = take_u64(buf)?;
    state.r10 = take_u64(buf)?;
    state.r11 = take_u64(buf)?;
    state.r12 = take_u64(buf)?;
    state.r13 = take_u64(buf)?;
    state.r14 = take_u64(buf)?;
    state.r15 = take_u64(buf)?;
    state.rip = take_u64(buf)?;
    state.rflags = take_u64(buf)?;
    state.cs = deserialize_segment(buf)?;
    state.ds = deserialize_segment(buf)?;
    state.es = deserialize_segment(buf)?;
    state.fs = deserialize_segment(buf)?;
    state.gs = deserialize_segment(buf)?;
    state.ss = deserialize_segment(buf)?;
    state.ldtr = deserialize_segment(buf)?;
    state.tr = deserialize_segment(buf)?;
    state.cr0 = take_u64(buf)?;
    state.cr2 = take_u64(buf)?;
    state.cr3 = take_u64(buf)?;
    state.cr4 = take_u64(buf)?;
    state.cr8 = take_u64(buf)?;
    state.efer = take_u64(buf)?;
    state.xcr0 = take_u64(buf)?;
    state.msrs = Vec::with_capacity(ENUMERATED_MSRS.len());
    for _ in 0..ENUMERATED_MSRS.len() {
        let msr = take_u32(buf)?;
        let value = take_u64(buf)?;
        state.msrs.push(MsrEntry { msr, value });
    }
    let fpu = take(buf, 4096)?;
    state.fpu_state = Box::new(fpu.try_into().unwrap());
    Ok(state)
}

/// Encodes a complete checkpoint: header, memory section, vCPU section,
/// device section, then the SHA-256 trailer over everything preceding it.
pub fn serialize(checkpoint: &Checkpoint, guest_memory_size: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    put_u16(&mut out, VERSION);
    put_u16(&mut out, checkpoint.flags);
    put_u64(&mut out, guest_memory_size);
    put_u64(&mut out, checkpoint.vcpus.len() as u64);
    put_u64(&mut out, checkpoint.devices.len() as u64);
    put_u64(&mut out, checkpoint.timestamp_ns);

    let mut memory_section = Vec::new();
    for chunk in &checkpoint.memory {
        put_u64(&mut memory_section, chunk.gpa);
        put_u32(&mut memory_section, chunk.bytes.len() as u32);
        memory_section.extend_from_slice(&chunk.bytes);
    }
    put_u64(&mut out, memory_section.len() as u64);
    out.extend_from_slice(&memory_section);

    for state in &checkpoint.vcpus {
        serialize_cpu_state(&mut out, state);
    }

    for device in &checkpoint.devices {
        put_u16(&mut out, device.device_id);
        put_u32(&mut out, device.bytes.len() as u32);
        out.extend_from_slice(&device.bytes);
    }

    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    out
}

/// Decodes and integrity-checks a checkpoint produced by [`serialize`].
/// Rejects cleanly (never silently misinterprets) on magic mismatch,
/// version mismatch, truncation, or trailer mismatch.
pub fn deserialize(bytes: &[u8]) -> Result<(Checkpoint, u64), MigrationError> {
    if bytes.len() < TRAILER_LEN {
        return Err(MigrationError::Truncated);
    }
    let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    let expected = Sha256::digest(body);
    if expected.as_slice() != trailer {
        return Err(MigrationError::IntegrityFailure);
    }

    let mut buf = body;
    let magic = take(&mut buf, 4)?;
    if magic != MAGIC {
        return Err(MigrationError::VersionMismatch);
    }
    let version = take_u16(&mut buf)?;
    if version != VERSION {
        return Err(MigrationError::VersionMismatch);
    }
    let flags = take_u16(&mut buf)?;
    let guest_memory_size = take_u64(&mut buf)?;
    let vcpu_count = take_u64(&mut buf)?;
    let device_count = take_u64(&mut buf)?;
    let timestamp_ns = take_u64(&mut buf)?;

    let memory_len = take_u64(&mut buf)? as usize;
    let mut memory_bytes = take(&mut buf, memory_len)?;
    let mut memory = Vec::new();
    while !memory_bytes.is_empty() {
        let gpa = take_u64(&mut memory_bytes)?;
        let len = take_u32(&mut memory_bytes)? as usize;
        let bytes = take(&mut memory_bytes, len)?.to_vec();
        memory.push(MemoryChunk { gpa, bytes });
    }

    let mut vcpus = Vec::with_capacity(vcpu_count as usize);
    for _ in 0..vcpu_count {
        vcpus.push(deserialize_cpu_state(&mut buf)?);
    }

    let mut devices = Vec::with_capacity(device_count as usize);
    for _ in 0..device_count {
        let device_id = take_u16(&mut buf)?;
        let len = take_u32(&mut buf)? as usize;
        let bytes = take(&mut buf, len)?.to_vec();
        devices.push(DeviceChunk { device_id, bytes });
    }

    Ok((Checkpoint { flags, timestamp_ns, memory, vcpus, devices }, guest_memory_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_memory_vcpu_and_device_sections() {
        let checkpoint = Checkpoint {
            flags: 0,
            timestamp_ns: 123_456,
            memory: vec![
                MemoryChunk { gpa: 0, bytes: vec![0xAA; 4096] },
                MemoryChunk { gpa: 4096, bytes: vec![0xBB; 4096] },
            ],
            vcpus: vec![CpuState { rax: 0xdead_beef, ..CpuState::default() }],
            devices: vec![DeviceChunk { device_id: 7, bytes: vec![1, 2, 3] }],
        };
        let bytes = serialize(&checkpoint, 8192);
        let (decoded, guest_memory_size) = deserialize(&bytes).unwrap();
        assert_eq!(guest_memory_size, 8192);
        assert_eq!(decoded.timestamp_ns, 123_456);
        assert_eq!(decoded.memory.len(), 2);
        assert_eq!(decoded.memory[1].gpa, 4096);
        assert_eq!(decoded.vcpus[0].rax, 0xdead_beef);
        assert_eq!(decoded.vcpus[0], checkpoint.vcpus[0]);
        assert_eq!(decoded.devices[0].device_id, 7);
    }

    #[test]
    fn corrupted_trailer_is_rejected_as_integrity_failure() {
        let checkpoint = Checkpoint {
            flags: 0,
            timestamp_ns: 0,
            memory: Vec::new(),
            vcpus: Vec::new(),
            devices: Vec::new(),
        };
        let mut bytes = serialize(&checkpoint, 0);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(deserialize(&bytes), Err(MigrationError::IntegrityFailure));
    }

    #[test]
    fn bad_magic_is_rejected_cleanly() {
        let mut bytes = serialize(
            &Checkpoint { flags: 0, timestamp_ns: 0, memory: Vec::new(), vcpus: Vec::new(), devices: Vec::new() },
            0,
        );
        bytes[0] = b'X';
        let digest = Sha256::digest(&bytes[..bytes.len() - 32]);
        bytes.truncate(bytes.len() - 32);
        bytes.extend_from_slice(&digest);
        assert_eq!(deserialize(&bytes), Err(MigrationError::VersionMismatch));
    }
}
