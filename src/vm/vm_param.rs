//! Machine-dependent VM parameters
//!
//! Layout of the simulated 32-bit MIPS-style address space: user space
//! occupies `[0, USERSPACETOP)`, the kernel direct map starts at
//! `MIPS_KSEG0` and maps physical address `p` at `MIPS_KSEG0 + p`.

/// Virtual address
pub type VAddr = u64;

/// Physical address
pub type PAddr = u64;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask selecting the page-number bits of an address
pub const PAGE_FRAME: u64 = !(PAGE_SIZE as u64 - 1);

/// Base of the kernel direct-mapped segment
pub const MIPS_KSEG0: u64 = 0x8000_0000;

/// First address past the end of user space
pub const USERSPACETOP: VAddr = MIPS_KSEG0;

/// Top of the user stack (initial stack pointer)
pub const USERSTACK: VAddr = USERSPACETOP;

/// Default maximum stack footprint (4MB)
pub const STACK_MAX: u64 = 4 * 1024 * 1024;

/// Lowest address the stack may ever grow down to
pub const USERSTACKBASE: VAddr = USERSTACK - STACK_MAX;

/// Default absolute ceiling on heap size (64MB)
pub const HEAP_MAX: u64 = 64 * 1024 * 1024;

/// Number of entries in each CPU's TLB
pub const NUM_TLB: usize = 64;

/// Default number of swap slots
pub const MAX_SWAP_PG_NUM: usize = 2000;

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & PAGE_FRAME
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & PAGE_FRAME
}

/// Check page alignment
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & !PAGE_FRAME == 0
}

/// Virtual page number of an address
pub const fn addr_to_vpn(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Physical frame number to physical address
pub const fn frame_to_paddr(frame: usize) -> PAddr {
    (frame as u64) << PAGE_SHIFT
}

/// Physical address to frame number
pub const fn paddr_to_frame(paddr: PAddr) -> usize {
    (paddr >> PAGE_SHIFT) as usize
}

/// Physical address to kernel virtual address
pub const fn paddr_to_kvaddr(paddr: PAddr) -> VAddr {
    paddr + MIPS_KSEG0
}

/// Kernel virtual address to physical address
pub const fn kvaddr_to_paddr(kvaddr: VAddr) -> PAddr {
    kvaddr - MIPS_KSEG0
}
