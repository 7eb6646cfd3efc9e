// SHOAL — MONOTONIC CLOCK
// Raw CLOCK_MONOTONIC nanoseconds for reassembly timestamps and timer
// deadlines. The engine samples time through an injected closure so tests
// can drive the fragment-timeout clock without sleeping.

use std::rc::Rc;

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Time source handle. Per-core, cheap to clone.
pub type ClockFn = Rc<dyn Fn() -> u64>;

/// The production clock: CLOCK_MONOTONIC.
pub fn system_clock() -> ClockFn {
    Rc::new(clock_ns)
}

pub const NS_PER_SEC: u64 = 1_000_000_000;
