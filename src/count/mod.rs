//! Per-worker hardware counters with mutator/GC phase accounting.
//!
//! [`Counters::init`] resolves the configured counter list once for the
//! process. Each worker thread then calls
//! [`init_worker`][Counters::init_worker] to build its own pair of event
//! sets (one counted during mutation, one during GC) plus a cycle
//! counter. Phase transitions start one set and accumulate-and-stop the
//! other; totals live in fixed arrays so nothing allocates after setup.
//!
//! When sampling is configured, the mutator set's sampling counter also
//! drives the instruction-pointer ring in [`crate::sample`], drained into
//! the event log whenever the mutator stops with enough samples gathered.

mod set;
#[cfg(test)]
mod test;

use std::fmt;
use std::io;
use std::sync::Arc;

use arrayvec::ArrayVec;
use thiserror::Error;

use crate::config::{CounterConfig, CounterSelection, SampleBy, UserCounterKind};
use crate::ffi::bindings as b;
use crate::sample::{self, SampleRing};
use crate::writer::CapBuffer;
use set::{CycleCounter, EventSet};

/// Most counters a worker collects at once. Keeps the per-phase
/// accumulators in fixed arrays.
pub const MAX_COUNTERS: usize = 10;

// Default sampling periods, in events of the sampling counter.
const SAMPLE_PERIOD_CYCLES: u64 = 100_000;
const SAMPLE_PERIOD_L1_MISS: u64 = 10_000;
const SAMPLE_PERIOD_L2_MISS: u64 = 1_000;

/// Errors that make counter collection unusable. The hosting runtime
/// should treat them as fatal; per-counter failures after init are only
/// reported.
#[derive(Debug, Error)]
pub enum Error {
    #[error("too many counters configured (max: {MAX_COUNTERS})")]
    TooManyCounters,

    #[error("unknown preset counter {0:?}")]
    UnknownPreset(String),

    #[error("invalid native event code {0:?}")]
    InvalidNativeCode(String),

    #[error("cannot install the overflow handler")]
    Handler(#[source] io::Error),

    #[error("worker counter setup failed")]
    ThreadInit(#[source] io::Error),
}

/// A resolved counter: perf type and config plus its display name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CounterEvent {
    pub name: String,
    pub ty: u32,
    pub config: u64,
}

fn preset(name: &str) -> Option<(u32, u64)> {
    let hw = |config| (b::PERF_TYPE_HARDWARE, config);
    let cache = |id, op, result| (b::PERF_TYPE_HW_CACHE, id | op << 8 | result << 16);
    Some(match name {
        "cycles" => hw(b::PERF_COUNT_HW_CPU_CYCLES),
        "instructions" => hw(b::PERF_COUNT_HW_INSTRUCTIONS),
        "cache-references" => hw(b::PERF_COUNT_HW_CACHE_REFERENCES),
        "cache-misses" => hw(b::PERF_COUNT_HW_CACHE_MISSES),
        "branches" => hw(b::PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
        "branch-misses" => hw(b::PERF_COUNT_HW_BRANCH_MISSES),
        "stalled-cycles-frontend" => hw(b::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
        "stalled-cycles-backend" => hw(b::PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
        "L1-dcache-loads" => cache(
            b::PERF_COUNT_HW_CACHE_L1D,
            b::PERF_COUNT_HW_CACHE_OP_READ,
            b::PERF_COUNT_HW_CACHE_RESULT_ACCESS,
        ),
        "L1-dcache-load-misses" => cache(
            b::PERF_COUNT_HW_CACHE_L1D,
            b::PERF_COUNT_HW_CACHE_OP_READ,
            b::PERF_COUNT_HW_CACHE_RESULT_MISS,
        ),
        "LLC-loads" => cache(
            b::PERF_COUNT_HW_CACHE_LL,
            b::PERF_COUNT_HW_CACHE_OP_READ,
            b::PERF_COUNT_HW_CACHE_RESULT_ACCESS,
        ),
        "LLC-load-misses" => cache(
            b::PERF_COUNT_HW_CACHE_LL,
            b::PERF_COUNT_HW_CACHE_OP_READ,
            b::PERF_COUNT_HW_CACHE_RESULT_MISS,
        ),
        _ => return None,
    })
}

fn preset_event(name: &str) -> CounterEvent {
    let (ty, config) = preset(name).expect("preset table entry");
    CounterEvent {
        name: name.to_owned(),
        ty,
        config,
    }
}

fn add_event(
    events: &mut ArrayVec<CounterEvent, MAX_COUNTERS>,
    ev: CounterEvent,
) -> Result<(), Error> {
    if events.is_full() {
        return Err(Error::TooManyCounters);
    }
    events.push(ev);
    Ok(())
}

pub(crate) struct SampleSpec {
    pub event: CounterEvent,
    pub period: u64,
}

/// Process-wide counter state: the resolved counter list and the sampling
/// setup shared by every worker.
pub struct Counters {
    events: ArrayVec<CounterEvent, MAX_COUNTERS>,
    sample: Option<SampleSpec>,
    /// `(miss, total)` indices the report turns into a percentage line.
    pct: Option<(usize, usize)>,
}

impl Counters {
    /// Resolves the configured counter list and, when sampling is
    /// enabled, installs the process-wide overflow handler.
    pub fn init(cfg: &CounterConfig) -> Result<Self, Error> {
        let mut events = ArrayVec::new();
        let mut pct = None;

        match &cfg.events {
            CounterSelection::Default => {
                add_event(&mut events, preset_event("cycles"))?;
            }
            CounterSelection::Branch => {
                add_event(&mut events, preset_event("branches"))?;
                add_event(&mut events, preset_event("branch-misses"))?;
                pct = Some((1, 0));
            }
            CounterSelection::Stalls => {
                add_event(&mut events, preset_event("stalled-cycles-frontend"))?;
                add_event(&mut events, preset_event("stalled-cycles-backend"))?;
            }
            CounterSelection::CacheL1 => {
                add_event(&mut events, preset_event("L1-dcache-loads"))?;
                add_event(&mut events, preset_event("L1-dcache-load-misses"))?;
                pct = Some((1, 0));
            }
            CounterSelection::CacheL2 => {
                add_event(&mut events, preset_event("LLC-loads"))?;
                add_event(&mut events, preset_event("LLC-load-misses"))?;
                pct = Some((1, 0));
            }
            CounterSelection::Native => {
                add_event(&mut events, preset_event("LLC-loads"))?;
                add_event(&mut events, preset_event("LLC-load-misses"))?;
                add_event(&mut events, preset_event("branch-misses"))?;
            }
            CounterSelection::User(list) => {
                for user in list {
                    let ev = match user.kind {
                        UserCounterKind::Preset => {
                            let (ty, config) = preset(&user.spec)
                                .ok_or_else(|| Error::UnknownPreset(user.spec.clone()))?;
                            CounterEvent {
                                name: user.spec.clone(),
                                ty,
                                config,
                            }
                        }
                        UserCounterKind::Native => {
                            let digits = user.spec.trim_start_matches("0x");
                            let config = u64::from_str_radix(digits, 16)
                                .map_err(|_| Error::InvalidNativeCode(user.spec.clone()))?;
                            CounterEvent {
                                name: user.spec.clone(),
                                ty: b::PERF_TYPE_RAW,
                                config,
                            }
                        }
                    };
                    add_event(&mut events, ev)?;
                }
            }
        }

        let sample = match cfg.sample_by {
            SampleBy::None => None,
            SampleBy::Cycles => Some(SampleSpec {
                event: preset_event("cycles"),
                period: cfg.sample_period.unwrap_or(SAMPLE_PERIOD_CYCLES),
            }),
            SampleBy::L1Miss => Some(SampleSpec {
                event: preset_event("L1-dcache-load-misses"),
                period: cfg.sample_period.unwrap_or(SAMPLE_PERIOD_L1_MISS),
            }),
            SampleBy::L2Miss => Some(SampleSpec {
                event: preset_event("LLC-load-misses"),
                period: cfg.sample_period.unwrap_or(SAMPLE_PERIOD_L2_MISS),
            }),
        };

        if let Some(spec) = &sample {
            // The sampling counter must be in every mutator set.
            let present = events
                .iter()
                .any(|ev| ev.ty == spec.event.ty && ev.config == spec.event.config);
            if !present {
                add_event(&mut events, spec.event.clone())?;
            }
            sample::install_overflow_handler().map_err(Error::Handler)?;
        }

        Ok(Self {
            events,
            sample,
            pct,
        })
    }

    /// Builds the calling worker thread's counter state: a mutator set,
    /// a GC set, the cycle counter and (when sampling) the sample ring
    /// wired up to the overflow handler.
    pub fn init_worker(&self) -> Result<WorkerCounters, Error> {
        let cycles = CycleCounter::open().map_err(Error::ThreadInit)?;
        let mutator = EventSet::open(&self.events, self.sample.as_ref());
        let gc = EventSet::open(&self.events, None);

        let ring = match mutator.sample_fd() {
            Some(fd) if self.sample.is_some() => {
                let ring = Arc::new(SampleRing::new());
                sample::arm_sigio(fd).map_err(Error::ThreadInit)?;
                sample::register(fd, &ring);
                Some(ring)
            }
            _ => None,
        };

        Ok(WorkerCounters {
            mutator,
            gc,
            cycles,
            mutator_counts: [0; MAX_COUNTERS],
            gc0_counts: [0; MAX_COUNTERS],
            gc1_counts: [0; MAX_COUNTERS],
            mutator_cycles: 0,
            gc0_cycles: 0,
            gc1_cycles: 0,
            start_mutator_cycles: 0,
            start_gc_cycles: 0,
            ring,
        })
    }

    /// Formats a worker's accumulated totals.
    pub fn report<'a>(&'a self, worker: &'a WorkerCounters) -> CounterReport<'a> {
        CounterReport {
            names: self.events.iter().map(|ev| ev.name.as_str()).collect(),
            pct: self.pct,
            mutator_cycles: worker.mutator_cycles,
            gc0_cycles: worker.gc0_cycles,
            gc1_cycles: worker.gc1_cycles,
            mutator: &worker.mutator_counts,
            gc0: &worker.gc0_counts,
            gc1: &worker.gc1_counts,
        }
    }
}

/// One worker thread's counter state.
///
/// The hosting runtime drives the phase transitions: start the mutator
/// set when the worker runs user code, stop it (accumulating) when it
/// enters the GC, and bracket GC work with the GC set. Minor collections
/// account into generation 0, major collections into generation 1.
pub struct WorkerCounters {
    mutator: EventSet,
    gc: EventSet,
    cycles: CycleCounter,
    mutator_counts: [u64; MAX_COUNTERS],
    gc0_counts: [u64; MAX_COUNTERS],
    gc1_counts: [u64; MAX_COUNTERS],
    mutator_cycles: u64,
    gc0_cycles: u64,
    gc1_cycles: u64,
    start_mutator_cycles: u64,
    start_gc_cycles: u64,
    ring: Option<Arc<SampleRing>>,
}

impl WorkerCounters {
    pub fn start_mutator(&mut self) {
        self.mutator.start();
        self.start_mutator_cycles = self.cycles.read();
    }

    /// Accumulates and stops the mutator set. With the sampling counter
    /// now quiet, any gathered instruction-pointer samples are drained
    /// into the capability's buffer.
    pub fn stop_mutator(&mut self, cap: &mut CapBuffer) {
        if self.start_mutator_cycles == 0 {
            return;
        }
        let now = self.cycles.read();
        if now > self.start_mutator_cycles {
            self.mutator_cycles += now - self.start_mutator_cycles;
        }
        self.start_mutator_cycles = 0;

        self.mutator.accum(&mut self.mutator_counts);
        self.mutator.stop();

        if let Some(ring) = &self.ring {
            ring.drain(|ips| cap.post_instr_ptr_sample(ips));
        }
    }

    pub fn start_gc(&mut self) {
        self.gc.start();
        self.start_gc_cycles = self.cycles.read();
    }

    /// Ends a minor collection.
    pub fn stop_gc0(&mut self) {
        self.gc.accum(&mut self.gc0_counts);
        self.gc.stop();
        self.gc0_cycles += self.cycles.read().saturating_sub(self.start_gc_cycles);
    }

    /// Ends a major collection.
    pub fn stop_gc1(&mut self) {
        self.gc.accum(&mut self.gc1_counts);
        self.gc.stop();
        self.gc1_cycles += self.cycles.read().saturating_sub(self.start_gc_cycles);
    }
}

impl Drop for WorkerCounters {
    fn drop(&mut self) {
        // Unhook the overflow handler's view before the ring goes away.
        if self.ring.is_some() {
            if let Some(fd) = self.mutator.sample_fd() {
                sample::unregister(fd);
            }
        }
    }
}

/// Per-phase counter totals, formatted like the runtime's stats output.
pub struct CounterReport<'a> {
    names: ArrayVec<&'a str, MAX_COUNTERS>,
    pct: Option<(usize, usize)>,
    mutator_cycles: u64,
    gc0_cycles: u64,
    gc1_cycles: u64,
    mutator: &'a [u64; MAX_COUNTERS],
    gc0: &'a [u64; MAX_COUNTERS],
    gc1: &'a [u64; MAX_COUNTERS],
}

impl CounterReport<'_> {
    fn section(
        &self,
        f: &mut fmt::Formatter<'_>,
        title: &str,
        cycles: u64,
        counts: &[u64; MAX_COUNTERS],
    ) -> fmt::Result {
        writeln!(f, "  {title}")?;
        writeln!(f, "  {:>15}  {:>15}", "CYCLES", with_commas(cycles))?;
        for (i, name) in self.names.iter().enumerate() {
            writeln!(f, "  {:>15}  {:>15}", name, with_commas(counts[i]))?;
        }
        if let Some((miss, total)) = self.pct {
            if counts[total] > 0 {
                let ratio = counts[miss] as f64 * 100.0 / counts[total] as f64;
                writeln!(
                    f,
                    "   {} % of {} : {ratio:.1}%",
                    self.names[miss], self.names[total],
                )?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for CounterReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.section(f, "Mutator CPU counters", self.mutator_cycles, self.mutator)?;
        writeln!(f)?;
        self.section(f, "GC(0) CPU counters", self.gc0_cycles, self.gc0)?;
        writeln!(f)?;
        self.section(f, "GC(1) CPU counters", self.gc1_cycles, self.gc1)
    }
}

fn with_commas(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
