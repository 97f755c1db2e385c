use std::fs::File;
use std::io::Result;

use arrayvec::ArrayVec;

use super::{CounterEvent, SampleSpec, MAX_COUNTERS};
use crate::ffi::bindings as b;
use crate::ffi::syscall;
use crate::ffi::Attr;

/// One perf counter fd plus the bookkeeping to scale multiplexed readings.
struct Counter {
    file: File,
    /// Index into the resolved event list, and so into the accumulators.
    /// Kept explicitly because counters that failed to open leave holes.
    idx: usize,
    prev_enabled: u64,
    prev_running: u64,
}

/// Counters follow the calling thread and count user space only, matching
/// the virtual per-thread counters of the original instrumentation.
fn open_counter(ty: u32, config: u64, sample_period: u64, disabled: bool) -> Result<File> {
    let mut attr = Attr {
        type_: ty,
        size: b::PERF_ATTR_SIZE_VER0,
        config,
        sample_period,
        read_format: b::PERF_FORMAT_TOTAL_TIME_ENABLED | b::PERF_FORMAT_TOTAL_TIME_RUNNING,
        ..Default::default()
    };
    attr.flags = b::ATTR_EXCLUDE_KERNEL | b::ATTR_EXCLUDE_HV;
    if disabled {
        attr.flags |= b::ATTR_DISABLED;
    }
    syscall::open_counter(&attr)
}

/// A worker's phase counters, enabled and disabled as a unit.
///
/// Each event gets its own fd so the kernel can multiplex sets wider than
/// the PMU; [`accum`][Self::accum] corrects for the time a counter was
/// scheduled off.
pub(super) struct EventSet {
    counters: ArrayVec<Counter, MAX_COUNTERS>,
    sample_idx: Option<usize>,
}

impl EventSet {
    /// Opens one disabled counter per event. A counter that fails to open
    /// is reported and left out of the set; the phase totals for its slot
    /// simply stay zero.
    pub fn open(events: &[CounterEvent], sample: Option<&SampleSpec>) -> Self {
        let mut counters = ArrayVec::new();
        let mut sample_idx = None;
        for (idx, ev) in events.iter().enumerate() {
            let period = match sample {
                Some(s) if s.event.ty == ev.ty && s.event.config == ev.config => s.period,
                _ => 0,
            };
            match open_counter(ev.ty, ev.config, period, true) {
                Ok(file) => {
                    if period > 0 {
                        sample_idx = Some(counters.len());
                    }
                    counters.push(Counter {
                        file,
                        idx,
                        prev_enabled: 0,
                        prev_running: 0,
                    });
                }
                Err(e) => log::warn!("failed to open counter {}: {e}", ev.name),
            }
        }
        Self {
            counters,
            sample_idx,
        }
    }

    /// The fd of the counter that drives instruction-pointer sampling.
    pub fn sample_fd(&self) -> Option<&File> {
        self.sample_idx.map(|i| &self.counters[i].file)
    }

    pub fn start(&self) {
        for c in &self.counters {
            if let Err(e) = syscall::enable(&c.file) {
                log::warn!("failed to start counter: {e}");
            }
        }
    }

    pub fn stop(&self) {
        for c in &self.counters {
            if let Err(e) = syscall::disable(&c.file) {
                log::warn!("failed to stop counter: {e}");
            }
        }
    }

    /// Adds each counter's count since the last accumulation into `into`
    /// and resets it. Counts are scaled by enabled/running time over the
    /// same window when the kernel had the counter multiplexed off.
    pub fn accum(&mut self, into: &mut [u64; MAX_COUNTERS]) {
        for c in &mut self.counters {
            let [value, enabled, running] = match syscall::read_counts(&c.file) {
                Ok(triple) => triple,
                Err(e) => {
                    log::warn!("failed to read counter: {e}");
                    continue;
                }
            };
            let d_enabled = enabled - c.prev_enabled;
            let d_running = running - c.prev_running;
            c.prev_enabled = enabled;
            c.prev_running = running;

            into[c.idx] += if d_running > 0 && d_running < d_enabled {
                (value as u128 * d_enabled as u128 / d_running as u128) as u64
            } else {
                value
            };

            if let Err(e) = syscall::reset(&c.file) {
                log::warn!("failed to reset counter: {e}");
            }
        }
    }
}

/// An always-running per-thread cycle counter, snapshotted at phase
/// boundaries.
pub(super) struct CycleCounter {
    file: File,
}

impl CycleCounter {
    pub fn open() -> Result<Self> {
        let file = open_counter(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_CPU_CYCLES, 0, false)?;
        Ok(Self { file })
    }

    pub fn read(&self) -> u64 {
        match syscall::read_counts(&self.file) {
            Ok([value, _, _]) => value,
            Err(e) => {
                log::warn!("failed to read cycle counter: {e}");
                0
            }
        }
    }
}
