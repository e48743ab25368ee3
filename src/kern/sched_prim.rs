//! Scheduling Primitives - Wait Channels
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! A wait channel is the only place a VM thread gives up its processor.
//! The protocol mirrors assert_wait/thread_block: the waiter takes a ticket
//! while it still holds the spinlock protecting the condition, drops the
//! lock, then sleeps on the ticket. A wakeup issued after the ticket was
//! taken is never lost. Waiters always re-check their condition after
//! waking; a wakeup is a hint, not a promise.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Why a thread is sleeping (for debugging/statistics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitReason {
    /// Waiting for a page table entry in transition
    VmPage = 3,
    /// Waiting for a frame to leave the VICTIM state
    VmFrame = 4,
}

/// Ticket proving a waiter registered before the wakeup it waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a wait ticket does nothing unless slept on"]
pub struct WaitTicket(u64);

/// Wait channel
#[derive(Debug)]
pub struct WaitChannel {
    /// Channel name (for debugging)
    name: &'static str,
    /// Bumped by every wakeup
    generation: AtomicU64,
    /// Threads currently asleep
    sleepers: AtomicUsize,
    /// Wakeups issued
    wakeups: AtomicU64,
}

impl WaitChannel {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: AtomicU64::new(0),
            sleepers: AtomicUsize::new(0),
            wakeups: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register intent to sleep; call with the condition's lock held
    pub fn prepare(&self) -> WaitTicket {
        WaitTicket(self.generation.load(Ordering::SeqCst))
    }

    /// Block until a wakeup newer than `ticket` has been issued
    pub fn sleep(&self, ticket: WaitTicket, reason: WaitReason) {
        log::trace!("wchan {}: sleep ({:?})", self.name, reason);
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        while self.generation.load(Ordering::SeqCst) == ticket.0 {
            cpu_relax();
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drop `guard` and sleep; the ticket is taken before the guard goes
    pub fn sleep_releasing<G>(&self, guard: G, reason: WaitReason) {
        let ticket = self.prepare();
        drop(guard);
        self.sleep(ticket, reason);
    }

    /// Wake every sleeper
    pub fn wakeup_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Wake at least one sleeper
    ///
    /// Sleepers cannot be told apart, so this wakes everyone; waiters re-check
    /// their condition anyway.
    pub fn wakeup_one(&self) {
        self.wakeup_all();
    }

    /// Threads currently asleep on the channel
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::SeqCst)
    }

    /// Wakeups issued so far
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

/// Give the processor away for a moment
#[inline]
pub fn cpu_relax() {
    #[cfg(feature = "std")]
    std::thread::yield_now();
    #[cfg(not(feature = "std"))]
    core::hint::spin_loop();
}
