//! Copyin/Copyout - User memory access through the TLB
//!
//! Based on Mach4 kern/kern_subr.c and machine/copyio.c
//!
//! These routines are how simulated user code touches its memory. Each
//! page is reached through the processor's TLB exactly as a load or store
//! would be: a miss raises a read or write fault, and a store through an
//! entry that is not writable raises a read-only fault. After the fault is
//! resolved the access is retried.
//!
//! The bytes are moved with interrupts masked on the processor, so a
//! shootdown for that page cannot complete while the access is under way.

use crate::error::{VmError, VmResult};
use crate::kern::processor::CpuId;
use crate::vm::vm_param::{trunc_page, VAddr, PAGE_SIZE, USERSPACETOP};
use crate::vm::{FaultType, VmSystem};

/// Is `[addr, addr + len)` inside user space
pub fn is_user_range(addr: VAddr, len: usize) -> bool {
    match addr.checked_add(len as u64) {
        Some(end) => end <= USERSPACETOP,
        None => false,
    }
}

/// Walk `[uaddr, uaddr + len)` page by page, handing each piece to `access`
/// once a usable translation is loaded
fn for_each_page<F>(vm: &VmSystem, cpu: CpuId, uaddr: VAddr, len: usize, write: bool, mut access: F) -> VmResult<()>
where
    F: FnMut(&mut [u8; PAGE_SIZE], usize, usize, usize),
{
    if !is_user_range(uaddr, len) {
        return Err(VmError::BadAddress(uaddr));
    }
    let processor = vm.cpu(cpu)?;
    let mut done = 0usize;
    while done < len {
        let addr = uaddr + done as u64;
        let offset = (addr - trunc_page(addr)) as usize;
        let chunk = (PAGE_SIZE - offset).min(len - done);

        let fault = {
            let spl = processor.splhigh();
            match spl.tlb.translate(addr) {
                Some(entry) if !write || entry.writable => {
                    let mut frame = vm.ram().frame(entry.pfn).lock();
                    access(&mut *frame, offset, done, chunk);
                    None
                }
                Some(_) => Some(FaultType::ReadOnly),
                None if write => Some(FaultType::Write),
                None => Some(FaultType::Read),
            }
        };

        match fault {
            Some(fault_type) => vm.vm_fault(cpu, fault_type, addr)?,
            None => done += chunk,
        }
    }
    Ok(())
}

/// Copy `buf.len()` bytes from user address `uaddr`
pub fn copyin(vm: &VmSystem, cpu: CpuId, uaddr: VAddr, buf: &mut [u8]) -> VmResult<()> {
    let len = buf.len();
    for_each_page(vm, cpu, uaddr, len, false, |frame, offset, done, chunk| {
        buf[done..done + chunk].copy_from_slice(&frame[offset..offset + chunk]);
    })
}

/// Copy `buf` to user address `uaddr`
pub fn copyout(vm: &VmSystem, cpu: CpuId, buf: &[u8], uaddr: VAddr) -> VmResult<()> {
    for_each_page(vm, cpu, uaddr, buf.len(), true, |frame, offset, done, chunk| {
        frame[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
    })
}

/// Fill `len` user bytes at `uaddr` with `value`
pub fn fillout(vm: &VmSystem, cpu: CpuId, value: u8, uaddr: VAddr, len: usize) -> VmResult<()> {
    for_each_page(vm, cpu, uaddr, len, true, |frame, offset, _done, chunk| {
        frame[offset..offset + chunk].fill(value);
    })
}

/// Fetch a little-endian word from user space
pub fn fuword32(vm: &VmSystem, cpu: CpuId, uaddr: VAddr) -> VmResult<u32> {
    let mut bytes = [0u8; 4];
    copyin(vm, cpu, uaddr, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Store a little-endian word to user space
pub fn suword32(vm: &VmSystem, cpu: CpuId, uaddr: VAddr, value: u32) -> VmResult<()> {
    copyout(vm, cpu, &value.to_le_bytes(), uaddr)
}
