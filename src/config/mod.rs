use std::path::PathBuf;

/// Event log writer configuration.
#[derive(Clone, Debug)]
pub struct WriterConfig {
    /// Program name or path; the log is written to `<program>.eventlog`.
    pub program: PathBuf,

    /// Set in post-fork children so the child logs to
    /// `<program>.<pid>.eventlog` instead of fighting the parent over
    /// the same file.
    pub forked: bool,

    /// Capacity of each event buffer in bytes.
    pub buffer_capacity: usize,
}

/// Default capacity of each event buffer.
pub const EVENT_LOG_SIZE: usize = 2 * 1024 * 1024;

impl WriterConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            forked: false,
            buffer_capacity: EVENT_LOG_SIZE,
        }
    }
}

/// Hardware counter configuration.
#[derive(Clone, Debug, Default)]
pub struct CounterConfig {
    /// Which counters each worker collects.
    pub events: CounterSelection,

    /// Which counter (if any) drives instruction-pointer sampling.
    pub sample_by: SampleBy,

    /// Overrides the default sampling period of [`SampleBy`].
    pub sample_period: Option<u64>,
}

/// Selects the counter list added to every worker's event sets.
///
/// Each selection resolves to at most [`MAX_COUNTERS`][crate::count::MAX_COUNTERS]
/// concrete counters. The kernel multiplexes counters that exceed the PMU
/// width; accumulated values are scaled accordingly.
#[derive(Clone, Debug, Default)]
pub enum CounterSelection {
    /// Total cycles only.
    #[default]
    Default,

    /// Conditional branches and branch mispredictions.
    Branch,

    /// Front- and backend stalled cycles.
    Stalls,

    /// L1 data cache accesses and misses.
    CacheL1,

    /// Last-level cache accesses and misses.
    CacheL2,

    /// The fixed cache-refill/branch-miss board: last-level reads, misses
    /// and mispredicted branches.
    Native,

    /// User-supplied counters, named or raw-coded.
    User(Vec<UserCounter>),
}

/// A user-supplied counter.
#[derive(Clone, Debug)]
pub struct UserCounter {
    /// Preset name (e.g. `"branch-misses"`) or hex event code,
    /// depending on [`kind`][Self::kind].
    pub spec: String,
    pub kind: UserCounterKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserCounterKind {
    /// [`spec`][UserCounter::spec] names one of the portable presets.
    Preset,

    /// [`spec`][UserCounter::spec] is a hex code passed to the PMU raw.
    Native,
}

/// Which hardware counter drives instruction-pointer sampling.
///
/// Each variant has a default sampling period (in events of that counter);
/// [`CounterConfig::sample_period`] overrides it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleBy {
    /// Sampling disabled.
    #[default]
    None,

    /// Every 100_000 cycles.
    Cycles,

    /// Every 10_000 L1 cache misses.
    L1Miss,

    /// Every 1_000 last-level cache misses.
    L2Miss,
}
