//! ELF Binary Loader
//!
//! Based on ELF64 specification and Mach4 loader patterns.
//!
//! Loads a little-endian ELF64 executable from a vnode into the address
//! space active on a processor. Each `PT_LOAD` segment becomes a region;
//! the file bytes are copied in through `copyout`, so every page is brought
//! in by the ordinary fault path.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::device::Vnode;
use crate::error::{VmError, VmResult};
use crate::kern::copyio::{copyout, fillout};
use crate::kern::processor::CpuId;
use crate::vm::vm_map::{AddrSpace, VmProt};
use crate::vm::vm_param::{round_page, VAddr, PAGE_SIZE};
use crate::vm::VmSystem;

// ============================================================================
// ELF Constants
// ============================================================================

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF class - 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding - little endian
pub const ELFDATA2LSB: u8 = 1;

/// ELF type - executable
pub const ET_EXEC: u16 = 2;

/// Program header type - loadable segment
pub const PT_LOAD: u32 = 1;

/// Program header flags - execute
pub const PF_X: u32 = 1;
/// Program header flags - write
pub const PF_W: u32 = 2;
/// Program header flags - read
pub const PF_R: u32 = 4;

/// Size of the ELF64 file header
pub const EHDR_SIZE: usize = 64;

/// Size of an ELF64 program header
pub const PHDR_SIZE: usize = 56;

/// Program headers accepted in one image
const MAX_PHNUM: u16 = 64;

// ============================================================================
// ELF Loader Errors
// ============================================================================

/// ELF loading error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    /// Invalid ELF magic number
    #[error("bad ELF magic")]
    InvalidMagic,
    /// Not a 64-bit ELF
    #[error("not an ELF64 image")]
    Not64Bit,
    /// Not little endian
    #[error("not a little-endian image")]
    InvalidEndian,
    /// Not an executable
    #[error("not an executable")]
    NotExecutable,
    /// Program header table is malformed
    #[error("invalid program header")]
    InvalidProgramHeader,
    /// Image ends before a header or segment does
    #[error("image truncated")]
    Truncated,
}

/// ELF loading result
pub type ElfResult<T> = Result<T, ElfError>;

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(w)
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(w)
}

// ============================================================================
// ELF Header Structures
// ============================================================================

/// ELF64 File Header (fields the loader uses)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    pub e_type: u16,
    pub e_machine: u16,
    /// Entry point address
    pub e_entry: u64,
    /// Program header offset
    pub e_phoff: u64,
    /// Program header entry size
    pub e_phentsize: u16,
    /// Number of program header entries
    pub e_phnum: u16,
}

impl Elf64Header {
    /// Decode and check a file header
    pub fn parse(data: &[u8]) -> ElfResult<Self> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfError::Not64Bit);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::InvalidEndian);
        }
        let header = Self {
            e_type: u16_at(data, 16),
            e_machine: u16_at(data, 18),
            e_entry: u64_at(data, 24),
            e_phoff: u64_at(data, 32),
            e_phentsize: u16_at(data, 54),
            e_phnum: u16_at(data, 56),
        };
        if header.e_type != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if (header.e_phentsize as usize) < PHDR_SIZE || header.e_phnum > MAX_PHNUM {
            return Err(ElfError::InvalidProgramHeader);
        }
        Ok(header)
    }
}

/// ELF64 Program Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Offset in file
    pub p_offset: u64,
    /// Virtual address in memory
    pub p_vaddr: u64,
    /// Size in file
    pub p_filesz: u64,
    /// Size in memory
    pub p_memsz: u64,
}

impl Elf64ProgramHeader {
    pub fn parse(data: &[u8]) -> ElfResult<Self> {
        if data.len() < PHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        Ok(Self {
            p_type: u32_at(data, 0),
            p_flags: u32_at(data, 4),
            p_offset: u64_at(data, 8),
            p_vaddr: u64_at(data, 16),
            p_filesz: u64_at(data, 32),
            p_memsz: u64_at(data, 40),
        })
    }

    /// Check if this is a loadable segment
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// Convert ELF flags to VM protection
    pub fn to_vm_prot(&self) -> VmProt {
        let mut prot = VmProt::empty();
        if (self.p_flags & PF_R) != 0 {
            prot |= VmProt::READ;
        }
        if (self.p_flags & PF_W) != 0 {
            prot |= VmProt::WRITE;
        }
        if (self.p_flags & PF_X) != 0 {
            prot |= VmProt::EXECUTE;
        }
        prot
    }
}

// ============================================================================
// ELF Loader
// ============================================================================

fn read_exact(vnode: &dyn Vnode, offset: u64, len: usize) -> VmResult<Vec<u8>> {
    let end = offset.checked_add(len as u64).ok_or(ElfError::Truncated)?;
    if end > vnode.size() {
        return Err(ElfError::Truncated.into());
    }
    let mut buf = vec![0u8; len];
    vnode.read_at(&mut buf, offset)?;
    Ok(buf)
}

/// Read the loadable segments of an image
pub fn load_headers(vnode: &dyn Vnode) -> VmResult<(Elf64Header, Vec<Elf64ProgramHeader>)> {
    let header = Elf64Header::parse(&read_exact(vnode, 0, EHDR_SIZE)?)?;
    let mut segments = Vec::new();
    for i in 0..header.e_phnum as u64 {
        let offset = (header.e_phentsize as u64)
            .checked_mul(i)
            .and_then(|rel| header.e_phoff.checked_add(rel))
            .ok_or(ElfError::Truncated)?;
        let phdr = Elf64ProgramHeader::parse(&read_exact(vnode, offset, PHDR_SIZE)?)?;
        if !phdr.is_load() {
            continue;
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(ElfError::InvalidProgramHeader.into());
        }
        segments.push(phdr);
    }
    Ok((header, segments))
}

fn load_segment(vm: &VmSystem, cpu: CpuId, vnode: &dyn Vnode, phdr: &Elf64ProgramHeader) -> VmResult<()> {
    let mut done = 0u64;
    while done < phdr.p_filesz {
        let chunk = (phdr.p_filesz - done).min(PAGE_SIZE as u64) as usize;
        let offset = phdr.p_offset.checked_add(done).ok_or(ElfError::Truncated)?;
        let bytes = read_exact(vnode, offset, chunk)?;
        copyout(vm, cpu, &bytes, phdr.p_vaddr + done)?;
        done += chunk as u64;
    }

    // Zero the rest of the last file page; later pages are demand-zero
    let bss = phdr.p_vaddr + phdr.p_filesz;
    let bss_end = (phdr.p_vaddr + phdr.p_memsz).min(round_page(bss));
    if bss_end > bss {
        fillout(vm, cpu, 0, bss, (bss_end - bss) as usize)?;
    }
    Ok(())
}

/// Load an executable into the address space active on `cpu`
///
/// Returns the entry point.
pub fn load_elf(vm: &VmSystem, cpu: CpuId, vnode: &dyn Vnode) -> VmResult<VAddr> {
    let aspace = vm.cpu(cpu)?.curas().ok_or(VmError::NoAddressSpace)?;
    let (header, segments) = load_headers(vnode)?;

    for phdr in &segments {
        aspace.define_region(phdr.p_vaddr, phdr.p_memsz, phdr.to_vm_prot())?;
    }
    aspace.check_regions()?;

    aspace.prepare_load();
    let loaded = segments
        .iter()
        .try_for_each(|phdr| load_segment(vm, cpu, vnode, phdr));
    vm.as_complete_load(&aspace);
    loaded?;

    log::info!(
        "elf: loaded {} segments into as {}, entry {:#x}",
        segments.len(),
        aspace.id().0,
        header.e_entry
    );
    Ok(header.e_entry)
}

/// Start a program: new address space, load the image, set up the stack
///
/// Returns the address space, the entry point and the initial stack pointer.
pub fn run_program(vm: &VmSystem, cpu: CpuId, vnode: &dyn Vnode) -> VmResult<(Arc<AddrSpace>, VAddr, VAddr)> {
    let aspace = vm.as_create();
    vm.as_activate(cpu, &aspace)?;

    let entry = match load_elf(vm, cpu, vnode) {
        Ok(entry) => entry,
        Err(e) => {
            vm.as_deactivate(cpu)?;
            vm.as_destroy(&aspace);
            return Err(e);
        }
    };
    let stackptr = aspace.define_stack();
    Ok((aspace, entry, stackptr))
}

// ============================================================================
// Tests
// ============================================================================
