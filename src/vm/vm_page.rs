//! Physical Page Management - RAM and the Coremap
//!
//! Based on Mach4 vm/vm_page.h/c
//!
//! The coremap holds one descriptor per physical frame. Every state change
//! happens under the coremap lock, and the lock is never held across I/O or
//! a sleep: a frame selected for reclaim is flipped to `Victim` before the
//! lock is dropped, and that state alone keeps every other thread away from
//! it until the selecting thread reassigns or restores it.

use alloc::boxed::Box;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::mem::size_of;
use spin::{Mutex, MutexGuard};

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::kern::random::Rng;
use crate::kern::sched_prim::WaitChannel;
use crate::vm::vm_map::{AddrSpace, AsId};
use crate::vm::vm_param::{frame_to_paddr, PAddr, VAddr, PAGE_SIZE};

/// Contents of one physical frame
pub type PageBuf = [u8; PAGE_SIZE];

// ============================================================================
// Physical Memory
// ============================================================================

#[derive(Debug)]
struct StealState {
    /// Next frame the boot stealer hands out
    next_frame: usize,
    /// Set once the coremap owns the remaining frames
    closed: bool,
}

/// Simulated physical memory
pub struct Ram {
    frames: Box<[Mutex<PageBuf>]>,
    steal: Mutex<StealState>,
}

impl Ram {
    pub fn new(nframes: usize) -> Self {
        let frames: Vec<Mutex<PageBuf>> = (0..nframes).map(|_| Mutex::new([0u8; PAGE_SIZE])).collect();
        Self {
            frames: frames.into_boxed_slice(),
            steal: Mutex::new(StealState {
                next_frame: 0,
                closed: false,
            }),
        }
    }

    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    /// Bump-allocate `npages` frames from the bottom of memory
    ///
    /// Only available until the coremap takes over; frames stolen here are
    /// never returned.
    pub fn ram_stealmem(&self, npages: usize) -> Option<PAddr> {
        let mut steal = self.steal.lock();
        if steal.closed || npages == 0 {
            return None;
        }
        let end = steal.next_frame.checked_add(npages)?;
        if end > self.frames.len() {
            return None;
        }
        let paddr = frame_to_paddr(steal.next_frame);
        steal.next_frame = end;
        Some(paddr)
    }

    /// First frame not consumed by the boot stealer
    pub fn first_free(&self) -> usize {
        self.steal.lock().next_frame
    }

    /// Stop the boot stealer and return the first frame it never handed out
    fn close_stealing(&self) -> usize {
        let mut steal = self.steal.lock();
        steal.closed = true;
        steal.next_frame
    }

    /// Raw access to a frame's contents
    pub fn frame(&self, frame: usize) -> &Mutex<PageBuf> {
        &self.frames[frame]
    }

    pub fn zero(&self, frame: usize) {
        self.frames[frame].lock().fill(0);
    }

    pub fn read_frame(&self, frame: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.frames[frame].lock()[..buf.len()]);
    }

    pub fn write_frame(&self, frame: usize, buf: &[u8]) {
        self.frames[frame].lock()[..buf.len()].copy_from_slice(buf);
    }

    /// Copy one frame into another without holding both locks at once
    pub fn copy_frame(&self, src: usize, dst: usize) {
        let mut bounce: Box<PageBuf> = Box::new([0u8; PAGE_SIZE]);
        self.read_frame(src, &mut bounce[..]);
        self.write_frame(dst, &bounce[..]);
    }
}

impl core::fmt::Debug for Ram {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ram")
            .field("nframes", &self.frames.len())
            .field("first_free", &self.first_free())
            .finish()
    }
}

// ============================================================================
// Frame Descriptors
// ============================================================================

/// Frame state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Unused
    Free,
    /// Kernel memory; never reclaimed
    Fixed,
    /// User page with an identical copy on swap
    Clean,
    /// User page whose only copy is in memory
    Dirty,
    /// Selected for reclaim or page-in; owned by the selecting thread
    Victim,
}

/// Page a user frame belongs to
#[derive(Debug, Clone)]
pub struct FrameOwner {
    pub aspace: Weak<AddrSpace>,
    pub asid: AsId,
    pub vaddr: VAddr,
}

impl FrameOwner {
    pub fn is(&self, asid: AsId, vaddr: VAddr) -> bool {
        self.asid == asid && self.vaddr == vaddr
    }
}

/// Coremap entry
#[derive(Debug, Clone)]
pub struct CoremapEntry {
    pub state: FrameState,
    /// Length of the kernel run starting here; zero if not a run head
    pub chunk: usize,
    /// Owning page for user frames
    pub owner: Option<FrameOwner>,
    /// Pin count; a wired frame is never reclaimed
    pub wired: u32,
}

impl CoremapEntry {
    const fn new(state: FrameState) -> Self {
        Self {
            state,
            chunk: 0,
            owner: None,
            wired: 0,
        }
    }

    /// Can this frame be evicted for a single-page request
    fn is_reclaimable(&self, clean_only: bool) -> bool {
        self.wired == 0
            && match self.state {
                FrameState::Clean => true,
                FrameState::Dirty => !clean_only,
                _ => false,
            }
    }

    /// Can this frame be part of a contiguous kernel run
    fn is_run_candidate(&self, clean_only: bool) -> bool {
        self.state == FrameState::Free || self.is_reclaimable(clean_only)
    }

    /// Held by another thread that will hand it back
    ///
    /// Wired frames do not count: the thread waiting may be the one that
    /// wired them.
    fn is_transient(&self) -> bool {
        self.state == FrameState::Victim
    }
}

/// Frame counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Census {
    pub free: usize,
    pub fixed: usize,
    pub clean: usize,
    pub dirty: usize,
    pub victim: usize,
    /// Frames currently pinned (counted in their state as well)
    pub wired: usize,
}

impl Census {
    /// Sum of the five states
    pub fn total(&self) -> usize {
        self.free + self.fixed + self.clean + self.dirty + self.victim
    }
}

/// A frame taken for reclaim, with what it was before
#[derive(Debug, Clone)]
pub struct VictimFrame {
    pub frame: usize,
    pub prior: FrameState,
    pub owner: Option<FrameOwner>,
}

/// Outcome of a frame search
#[derive(Debug)]
pub enum Selection<T> {
    /// Frames are marked `Victim` and belong to the caller
    Ready(T),
    /// Only frames in transition could satisfy the request; sleep and retry
    Wait(crate::kern::sched_prim::WaitTicket),
    /// Nothing can satisfy the request
    Exhausted,
}

/// Which frames may be reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimPolicy {
    AnyReclaimable,
    /// Swap is full; only frames that need no writeback
    CleanOnly,
}

// ============================================================================
// Coremap
// ============================================================================

/// Coremap state protected by the coremap lock
#[derive(Debug)]
pub struct CoremapInner {
    entries: Vec<CoremapEntry>,
    rng: Rng,
}

impl CoremapInner {
    pub fn entry(&self, frame: usize) -> &CoremapEntry {
        &self.entries[frame]
    }

    pub fn entry_mut(&mut self, frame: usize) -> &mut CoremapEntry {
        &mut self.entries[frame]
    }

    fn take(&mut self, frame: usize) -> VictimFrame {
        let entry = &mut self.entries[frame];
        let victim = VictimFrame {
            frame,
            prior: entry.state,
            owner: entry.owner.clone(),
        };
        entry.state = FrameState::Victim;
        victim
    }
}

/// Physical frame allocator
#[derive(Debug)]
pub struct Coremap {
    inner: Mutex<CoremapInner>,
    /// First frame the coremap manages; everything below was stolen at boot
    first: usize,
    clean_watermark: usize,
    max_probes: usize,
    /// Threads waiting for a frame to leave `Victim`
    wchan: WaitChannel,
}

impl Coremap {
    /// Build the coremap, stealing the frames its own metadata occupies
    pub fn bootstrap(ram: &Ram, config: &VmConfig) -> VmResult<Self> {
        let nframes = ram.nframes();
        let meta_bytes = nframes * size_of::<CoremapEntry>();
        let meta_pages = (meta_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        ram.ram_stealmem(meta_pages).ok_or(VmError::OutOfMemory)?;

        let first = ram.close_stealing();
        if first >= nframes {
            return Err(VmError::OutOfMemory);
        }

        let entries = (0..nframes)
            .map(|i| {
                if i < first {
                    CoremapEntry::new(FrameState::Fixed)
                } else {
                    CoremapEntry::new(FrameState::Free)
                }
            })
            .collect();

        log::info!(
            "coremap: {} frames, {} reserved at boot, {} managed",
            nframes,
            first,
            nframes - first
        );

        Ok(Self {
            inner: Mutex::new(CoremapInner {
                entries,
                rng: Rng::new(config.rng_seed),
            }),
            first,
            clean_watermark: config.clean_watermark,
            max_probes: config.max_probes,
            wchan: WaitChannel::new("coremap"),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, CoremapInner> {
        self.inner.lock()
    }

    pub fn wchan(&self) -> &WaitChannel {
        &self.wchan
    }

    pub fn first_managed(&self) -> usize {
        self.first
    }

    pub fn nframes(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Count frames in each state
    pub fn census(&self) -> Census {
        let inner = self.inner.lock();
        let mut census = Census::default();
        for entry in &inner.entries {
            match entry.state {
                FrameState::Free => census.free += 1,
                FrameState::Fixed => census.fixed += 1,
                FrameState::Clean => census.clean += 1,
                FrameState::Dirty => census.dirty += 1,
                FrameState::Victim => census.victim += 1,
            }
            if entry.wired > 0 {
                census.wired += 1;
            }
        }
        census
    }

    /// Recorded owner of a user frame
    pub fn owner_of(&self, frame: usize) -> Option<(AsId, VAddr)> {
        let inner = self.inner.lock();
        inner.entries.get(frame)?.owner.as_ref().map(|o| (o.asid, o.vaddr))
    }

    pub fn state_of(&self, frame: usize) -> Option<FrameState> {
        self.inner.lock().entries.get(frame).map(|e| e.state)
    }

    fn wait_or_exhausted<T>(&self, inner: &CoremapInner) -> Selection<T> {
        if inner.entries[self.first..].iter().any(|e| e.is_transient()) {
            Selection::Wait(self.wchan.prepare())
        } else {
            Selection::Exhausted
        }
    }

    /// Pick one frame for a user page
    ///
    /// A free frame is taken when one exists. Otherwise a reclaimable frame
    /// is sampled at random, restricted to clean frames when at least
    /// `clean_watermark` of them exist.
    pub fn select_page(&self, policy: VictimPolicy) -> Selection<VictimFrame> {
        let mut inner = self.inner.lock();
        let nframes = inner.entries.len();

        if let Some(frame) = (self.first..nframes).find(|&i| {
            let e = &inner.entries[i];
            e.state == FrameState::Free && e.wired == 0
        }) {
            return Selection::Ready(inner.take(frame));
        }

        let clean_only = policy == VictimPolicy::CleanOnly;
        let candidates = inner.entries[self.first..]
            .iter()
            .filter(|e| e.is_reclaimable(clean_only))
            .count();
        if candidates == 0 {
            return self.wait_or_exhausted(&inner);
        }

        let clean = inner.entries[self.first..]
            .iter()
            .filter(|e| e.is_reclaimable(true))
            .count();
        let want_clean = clean_only || (clean > 0 && clean >= self.clean_watermark);

        let mut chosen = None;
        for _ in 0..self.max_probes.max(1) * 4 {
            let i = inner.rng.range(self.first, nframes);
            if inner.entries[i].is_reclaimable(want_clean) {
                chosen = Some(i);
                break;
            }
        }
        let frame = match chosen {
            Some(frame) => frame,
            None => {
                let start = inner.rng.range(self.first, nframes);
                let span = nframes - self.first;
                match (0..span)
                    .map(|k| self.first + (start - self.first + k) % span)
                    .find(|&i| inner.entries[i].is_reclaimable(want_clean))
                {
                    Some(frame) => frame,
                    None => return self.wait_or_exhausted(&inner),
                }
            }
        };
        Selection::Ready(inner.take(frame))
    }

    fn run_fits(inner: &CoremapInner, start: usize, npages: usize, clean_only: bool) -> bool {
        inner.entries[start..start + npages]
            .iter()
            .all(|e| e.is_run_candidate(clean_only))
    }

    /// Pick `npages` contiguous frames for the kernel
    pub fn select_run(&self, npages: usize, policy: VictimPolicy) -> Selection<Vec<VictimFrame>> {
        let mut inner = self.inner.lock();
        let nframes = inner.entries.len();
        if npages == 0 || npages > nframes - self.first {
            return Selection::Exhausted;
        }
        let last_start = nframes - npages;

        let free_run = (self.first..=last_start).find(|&s| {
            inner.entries[s..s + npages]
                .iter()
                .all(|e| e.state == FrameState::Free && e.wired == 0)
        });

        let start = match free_run {
            Some(start) => Some(start),
            None => {
                let clean_starts: Vec<usize> = (self.first..=last_start)
                    .filter(|&s| Self::run_fits(&inner, s, npages, true))
                    .collect();
                let clean_only = policy == VictimPolicy::CleanOnly;
                if !clean_starts.is_empty()
                    && (clean_only || clean_starts.len() >= self.clean_watermark)
                {
                    let pick = inner.rng.below(clean_starts.len());
                    Some(clean_starts[pick])
                } else if clean_only {
                    None
                } else {
                    self.probe_run(&mut inner, npages, last_start)
                }
            }
        };

        match start {
            Some(start) => {
                let victims = (start..start + npages).map(|i| inner.take(i)).collect();
                Selection::Ready(victims)
            }
            None => self.wait_or_exhausted(&inner),
        }
    }

    /// Random probes that skip starts already tried, then a linear scan
    fn probe_run(&self, inner: &mut CoremapInner, npages: usize, last_start: usize) -> Option<usize> {
        let mut tried: Vec<usize> = Vec::with_capacity(self.max_probes);
        for _ in 0..self.max_probes {
            let start = inner.rng.range(self.first, last_start + 1);
            if tried.contains(&start) {
                continue;
            }
            if Self::run_fits(inner, start, npages, false) {
                return Some(start);
            }
            tried.push(start);
        }
        (self.first..=last_start)
            .filter(|s| !tried.contains(s))
            .find(|&s| Self::run_fits(inner, s, npages, false))
    }

    /// Put victims back the way they were found
    ///
    /// A user frame whose page was freed while it was a victim has no owner
    /// left and becomes free instead.
    pub fn restore(&self, victims: &[VictimFrame]) {
        let mut inner = self.inner.lock();
        for victim in victims {
            let entry = &mut inner.entries[victim.frame];
            assert_eq!(entry.state, FrameState::Victim, "restoring frame {} not held", victim.frame);
            let orphaned = matches!(victim.prior, FrameState::Clean | FrameState::Dirty)
                && entry.owner.is_none();
            if orphaned {
                entry.state = FrameState::Free;
            } else {
                entry.state = victim.prior;
            }
        }
        drop(inner);
        self.wchan.wakeup_all();
    }

    /// Free frames the caller holds as victims
    pub fn release_victims(&self, victims: &[VictimFrame]) {
        let mut inner = self.inner.lock();
        for victim in victims {
            let entry = &mut inner.entries[victim.frame];
            assert_eq!(entry.state, FrameState::Victim);
            *entry = CoremapEntry::new(FrameState::Free);
        }
        drop(inner);
        self.wchan.wakeup_all();
    }

    /// Free a single held frame that was never handed out
    pub fn release_claimed(&self, frame: usize) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[frame];
        assert_eq!(entry.state, FrameState::Victim, "frame {} released while not held", frame);
        *entry = CoremapEntry::new(FrameState::Free);
        drop(inner);
        self.wchan.wakeup_all();
    }

    /// Forget the previous owner of a frame the caller has just reclaimed
    pub fn disown(&self, frame: usize) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[frame];
        assert_eq!(entry.state, FrameState::Victim);
        entry.owner = None;
    }

    /// Hand a held frame to a user page
    pub fn assign_user(&self, frame: usize, owner: FrameOwner, state: FrameState) {
        debug_assert!(matches!(state, FrameState::Clean | FrameState::Dirty));
        let mut inner = self.inner.lock();
        assign_user_locked(&mut inner, frame, owner, state);
        drop(inner);
        self.wchan.wakeup_all();
    }

    /// Turn held frames into a kernel run
    pub fn assign_kernel_run(&self, start: usize, npages: usize) {
        let mut inner = self.inner.lock();
        for i in start..start + npages {
            let entry = &mut inner.entries[i];
            assert_eq!(entry.state, FrameState::Victim);
            *entry = CoremapEntry::new(FrameState::Fixed);
        }
        inner.entries[start].chunk = npages;
        drop(inner);
        self.wchan.wakeup_all();
    }

    /// Free the kernel run starting at `frame`, returning its length
    pub fn free_run(&self, frame: usize) -> VmResult<usize> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(frame).ok_or(VmError::InvalidArgument)?;
        if entry.state != FrameState::Fixed || entry.chunk == 0 {
            return Err(VmError::InvalidArgument);
        }
        let npages = entry.chunk;
        for i in frame..frame + npages {
            inner.entries[i] = CoremapEntry::new(FrameState::Free);
        }
        drop(inner);
        self.wchan.wakeup_all();
        Ok(npages)
    }

    /// Release a user frame whose page table entry is being removed
    ///
    /// Call with the owning page table locked. A frame that is currently a
    /// victim stays with its evictor and only loses its owner.
    pub fn release_user(&self, frame: usize, asid: AsId, vaddr: VAddr) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[frame];
        if entry.state == FrameState::Victim {
            entry.owner = None;
            return;
        }
        assert!(
            entry.owner.as_ref().is_some_and(|o| o.is(asid, vaddr)),
            "frame {} released by a page that does not own it",
            frame
        );
        assert_eq!(entry.wired, 0, "releasing wired frame {}", frame);
        *entry = CoremapEntry::new(FrameState::Free);
        drop(inner);
        self.wchan.wakeup_all();
    }

    /// Pin a user frame; returns a ticket to sleep on if it is being reclaimed
    pub fn wire(&self, frame: usize) -> Result<(), crate::kern::sched_prim::WaitTicket> {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[frame];
        if entry.state == FrameState::Victim {
            return Err(self.wchan.prepare());
        }
        entry.wired += 1;
        Ok(())
    }

    pub fn unwire(&self, frame: usize) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[frame];
        assert!(entry.wired > 0, "unwiring frame {} that is not wired", frame);
        entry.wired -= 1;
        let now_free = entry.wired == 0;
        drop(inner);
        if now_free {
            self.wchan.wakeup_all();
        }
    }
}

pub(crate) fn assign_user_locked(
    inner: &mut CoremapInner,
    frame: usize,
    owner: FrameOwner,
    state: FrameState,
) {
    let entry = &mut inner.entries[frame];
    assert_eq!(entry.state, FrameState::Victim, "frame {} assigned while not held", frame);
    entry.state = state;
    entry.chunk = 0;
    entry.owner = Some(owner);
}
