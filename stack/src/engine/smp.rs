// SHOAL — CROSS-CORE MESSAGE PASSING
// The only concurrency primitive in the stack. Each core owns one inbox;
// `submit_to` enqueues work that the target core's loop drains and runs to
// completion. Submission is best-effort with no timeout; per-flow ordering
// holds because a flow is always steered to the same inbox.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::net::CpuId;
use crate::packet::Packet;

/// Work item for a peer core.
pub enum CoreTask {
    /// Opaque deferred work. Retargeted release hooks arrive this way.
    Run(Box<dyn FnOnce() + Send>),
    /// A forwarded Ethernet frame for the peer's receive entry.
    Rx(Packet),
}

/// The core fabric. One inbox per core; the mutex is cold (touched only by
/// cross-core traffic, never by a core's local hot path).
pub struct Smp {
    inboxes: Vec<Mutex<VecDeque<CoreTask>>>,
}

impl Smp {
    pub fn new(count: u32) -> Arc<Smp> {
        let inboxes = (0..count).map(|_| Mutex::new(VecDeque::new())).collect();
        Arc::new(Smp { inboxes })
    }

    #[inline(always)]
    pub fn count(&self) -> u32 {
        self.inboxes.len() as u32
    }

    /// Enqueue a task for `cpu`. Best-effort: nothing is surfaced to the
    /// submitter.
    pub fn submit_to(&self, cpu: CpuId, task: CoreTask) {
        self.inboxes[cpu as usize].lock().push_back(task);
    }

    /// Take everything currently queued for `cpu`. Called from the owning
    /// core's loop only.
    pub fn drain(&self, cpu: CpuId) -> VecDeque<CoreTask> {
        std::mem::take(&mut *self.inboxes[cpu as usize].lock())
    }

    pub fn pending(&self, cpu: CpuId) -> usize {
        self.inboxes[cpu as usize].lock().len()
    }
}

// ============================================================================
// CURRENT-CORE TRACKING
// ============================================================================

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
}

/// Record which logical core this thread runs. Called once by each worker
/// before entering its loop.
pub fn pin_current(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

#[inline(always)]
pub fn this_cpu() -> CpuId {
    CURRENT_CPU.with(|c| c.get())
}

/// Bind the calling thread to a hardware CPU. Worker threads call this on
/// entry so the shared-nothing partitioning maps 1:1 onto hardware.
#[cfg(target_os = "linux")]
pub fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(core, "sched_setaffinity failed, running unpinned");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_core(_core: usize) {}
