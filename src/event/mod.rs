//! Event tags, payload schemas and the self-describing header table.
//!
//! Every event on the wire is `(tag:16, timestamp:64, payload)`, with a
//! 16-bit byte length between timestamp and payload for variable-sized
//! tags. The log header enumerates `(tag, size, description)` for every
//! live tag, so the numbering here is part of the format and must not be
//! reshuffled. Retired tags keep their numbers as permanent holes.


use crate::writer::buf::EventsBuf;

/// Thread id as it appears on the wire.
pub type ThreadId = u32;
/// Capability (worker) number as it appears on the wire.
pub type CapNo = u16;
/// Capability-set id as it appears on the wire.
pub type CapsetId = u32;
/// Nanoseconds since program start.
pub type Timestamp = u64;

/// Producer number used for events not owned by any capability.
pub const SHARED_CAP: CapNo = CapNo::MAX;

/// Number of tag slots, deprecated holes included.
pub const NUM_TAGS: u16 = 54;

/// Tag numbers with no live event type. Never emitted in the header
/// table nor on the wire.
pub(crate) const DEPRECATED_TAGS: &[u16] = &[5, 6, 13, 14, 23, 24, 42];

// Stream sentinels. Stable across versions.
pub const HEADER_BEGIN: u32 = 0x6864_7262; // 'h' 'd' 'r' 'b'
pub const HEADER_END: u32 = 0x6864_7265; // 'h' 'd' 'r' 'e'
pub const DATA_BEGIN: u32 = 0x6461_7462; // 'd' 'a' 't' 'b'
pub const DATA_END: u16 = 0xffff;
pub const HET_BEGIN: u32 = 0x6865_7462; // 'h' 'e' 't' 'b'
pub const HET_END: u32 = 0x6865_7465; // 'h' 'e' 't' 'e'
pub const ET_BEGIN: u32 = 0x6574_6200; // 'e' 't' 'b' \0
pub const ET_END: u32 = 0x6574_6500; // 'e' 't' 'e' \0

/// Declared-size sentinel for variable-length payloads.
pub const SIZE_VARIABLE: u16 = 0xffff;
/// Declared-size sentinel for retired tags.
pub const SIZE_DEPRECATED: u16 = 0xfffe;

/// Event type number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    CreateThread = 0,
    RunThread = 1,
    StopThread = 2,
    ThreadRunnable = 3,
    MigrateThread = 4,
    Shutdown = 7,
    ThreadWakeup = 8,
    GcStart = 9,
    GcEnd = 10,
    RequestSeqGc = 11,
    RequestParGc = 12,
    CreateSparkThread = 15,
    LogMsg = 16,
    Startup = 17,
    BlockMarker = 18,
    UserMsg = 19,
    GcIdle = 20,
    GcWork = 21,
    GcDone = 22,
    CapsetCreate = 25,
    CapsetDelete = 26,
    CapsetAssignCap = 27,
    CapsetRemoveCap = 28,
    RtsIdentifier = 29,
    ProgramArgs = 30,
    ProgramEnv = 31,
    OsProcessPid = 32,
    OsProcessPpid = 33,
    SparkCounters = 34,
    SparkCreate = 35,
    SparkDud = 36,
    SparkOverflow = 37,
    SparkRun = 38,
    SparkSteal = 39,
    SparkFizzle = 40,
    SparkGc = 41,
    WallClockTime = 43,
    ThreadLabel = 44,
    HpcModule = 45,
    TickDump = 46,
    InstrPtrSample = 47,
    DebugModule = 48,
    DebugProcedure = 49,
    DebugSource = 50,
    DebugCore = 51,
    DebugName = 52,
    DebugPtrRange = 53,
}

/// Declared payload size of a live tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadSize {
    /// Exactly this many payload bytes.
    Fixed(u16),
    /// A 16-bit byte length precedes the payload on the wire.
    Variable,
}

impl PayloadSize {
    /// The size field as written into the header table.
    pub fn on_wire(self) -> u16 {
        match self {
            PayloadSize::Fixed(n) => n,
            PayloadSize::Variable => SIZE_VARIABLE,
        }
    }
}

const THREAD_ID: u16 = 4;
const CAP_NO: u16 = 2;
const CAPSET_ID: u16 = 4;

impl Tag {
    pub fn from_u16(n: u16) -> Option<Tag> {
        use Tag::*;
        Some(match n {
            0 => CreateThread,
            1 => RunThread,
            2 => StopThread,
            3 => ThreadRunnable,
            4 => MigrateThread,
            7 => Shutdown,
            8 => ThreadWakeup,
            9 => GcStart,
            10 => GcEnd,
            11 => RequestSeqGc,
            12 => RequestParGc,
            15 => CreateSparkThread,
            16 => LogMsg,
            17 => Startup,
            18 => BlockMarker,
            19 => UserMsg,
            20 => GcIdle,
            21 => GcWork,
            22 => GcDone,
            25 => CapsetCreate,
            26 => CapsetDelete,
            27 => CapsetAssignCap,
            28 => CapsetRemoveCap,
            29 => RtsIdentifier,
            30 => ProgramArgs,
            31 => ProgramEnv,
            32 => OsProcessPid,
            33 => OsProcessPpid,
            34 => SparkCounters,
            35 => SparkCreate,
            36 => SparkDud,
            37 => SparkOverflow,
            38 => SparkRun,
            39 => SparkSteal,
            40 => SparkFizzle,
            41 => SparkGc,
            43 => WallClockTime,
            44 => ThreadLabel,
            45 => HpcModule,
            46 => TickDump,
            47 => InstrPtrSample,
            48 => DebugModule,
            49 => DebugProcedure,
            50 => DebugSource,
            51 => DebugCore,
            52 => DebugName,
            53 => DebugPtrRange,
            _ => return None,
        })
    }

    /// Declared payload size.
    pub fn size(self) -> PayloadSize {
        use PayloadSize::*;
        use Tag::*;
        match self {
            CreateThread | RunThread | ThreadRunnable | CreateSparkThread => Fixed(THREAD_ID),

            MigrateThread | ThreadWakeup => Fixed(THREAD_ID + CAP_NO),

            StopThread => Fixed(THREAD_ID + 2 + THREAD_ID),

            Startup => Fixed(CAP_NO),

            CapsetCreate => Fixed(CAPSET_ID + 2),
            CapsetDelete => Fixed(CAPSET_ID),
            CapsetAssignCap | CapsetRemoveCap => Fixed(CAPSET_ID + CAP_NO),
            OsProcessPid | OsProcessPpid => Fixed(CAPSET_ID + 4),

            SparkSteal => Fixed(CAP_NO),

            Shutdown | RequestSeqGc | RequestParGc | GcStart | GcEnd | GcIdle | GcWork | GcDone
            | SparkCreate | SparkDud | SparkOverflow | SparkRun | SparkFizzle | SparkGc => Fixed(0),

            SparkCounters => Fixed(7 * 8),

            BlockMarker => Fixed(4 + 8 + CAP_NO),

            DebugPtrRange => Fixed(8 + 8),

            WallClockTime => Fixed(CAPSET_ID + 8 + 4),

            LogMsg | UserMsg | RtsIdentifier | ProgramArgs | ProgramEnv | ThreadLabel
            | HpcModule | TickDump | InstrPtrSample | DebugModule | DebugProcedure
            | DebugSource | DebugCore | DebugName => Variable,
        }
    }

    /// Human-readable description, as written into the header table.
    pub fn desc(self) -> &'static str {
        use Tag::*;
        match self {
            CreateThread => "Create thread",
            RunThread => "Run thread",
            StopThread => "Stop thread",
            ThreadRunnable => "Thread runnable",
            MigrateThread => "Migrate thread",
            Shutdown => "Shutdown",
            ThreadWakeup => "Wakeup thread",
            ThreadLabel => "Thread label",
            GcStart => "Starting GC",
            GcEnd => "Finished GC",
            RequestSeqGc => "Request sequential GC",
            RequestParGc => "Request parallel GC",
            CreateSparkThread => "Create spark thread",
            LogMsg => "Log message",
            UserMsg => "User message",
            Startup => "Startup",
            GcIdle => "GC idle",
            GcWork => "GC working",
            GcDone => "GC done",
            BlockMarker => "Block marker",
            CapsetCreate => "Create capability set",
            CapsetDelete => "Delete capability set",
            CapsetAssignCap => "Add capability to capability set",
            CapsetRemoveCap => "Remove capability from capability set",
            RtsIdentifier => "RTS name and version",
            ProgramArgs => "Program arguments",
            ProgramEnv => "Program environment variables",
            OsProcessPid => "Process ID",
            OsProcessPpid => "Parent process ID",
            WallClockTime => "Wall clock time",
            SparkCounters => "Spark counters",
            SparkCreate => "Spark create",
            SparkDud => "Spark dud",
            SparkOverflow => "Spark overflow",
            SparkRun => "Spark run",
            SparkSteal => "Spark steal",
            SparkFizzle => "Spark fizzle",
            SparkGc => "Spark GC",
            HpcModule => "HPC module",
            TickDump => "Tick dump",
            InstrPtrSample => "Instruction pointer sample",
            DebugModule => "Debug module data",
            DebugProcedure => "Debug procedure data",
            DebugSource => "Debug source data",
            DebugCore => "Debug core data",
            DebugName => "Debug name data",
            DebugPtrRange => "Debug pointer range",
        }
    }

    /// All live tags in numeric order.
    pub fn all() -> impl Iterator<Item = Tag> {
        (0..NUM_TAGS).filter_map(Tag::from_u16)
    }
}

/// Checks that every slot below [`NUM_TAGS`] is either a live tag or a
/// recorded deprecated hole. A gap means the tag table and the numbering
/// went out of sync, which init treats as fatal.
pub(crate) fn table_is_complete() -> bool {
    (0..NUM_TAGS).all(|n| Tag::from_u16(n).is_some() || DEPRECATED_TAGS.contains(&n))
}

/// Scheduler events, attributed to the posting capability.
#[derive(Clone, Copy, Debug)]
pub enum SchedEvent {
    CreateThread { thread: ThreadId },
    RunThread { thread: ThreadId },
    ThreadRunnable { thread: ThreadId },
    MigrateThread { thread: ThreadId, new_cap: CapNo },
    ThreadWakeup { thread: ThreadId, other_cap: CapNo },
    StopThread { thread: ThreadId, status: u16, blocked_on: ThreadId },
    Shutdown,
}

impl SchedEvent {
    pub(crate) fn tag(self) -> Tag {
        match self {
            SchedEvent::CreateThread { .. } => Tag::CreateThread,
            SchedEvent::RunThread { .. } => Tag::RunThread,
            SchedEvent::ThreadRunnable { .. } => Tag::ThreadRunnable,
            SchedEvent::MigrateThread { .. } => Tag::MigrateThread,
            SchedEvent::ThreadWakeup { .. } => Tag::ThreadWakeup,
            SchedEvent::StopThread { .. } => Tag::StopThread,
            SchedEvent::Shutdown => Tag::Shutdown,
        }
    }

    pub(crate) fn put_payload(self, eb: &mut EventsBuf) {
        match self {
            SchedEvent::CreateThread { thread }
            | SchedEvent::RunThread { thread }
            | SchedEvent::ThreadRunnable { thread } => eb.put_u32(thread),
            SchedEvent::MigrateThread { thread, new_cap: cap }
            | SchedEvent::ThreadWakeup { thread, other_cap: cap } => {
                eb.put_u32(thread);
                eb.put_u16(cap);
            }
            SchedEvent::StopThread { thread, status, blocked_on } => {
                eb.put_u32(thread);
                eb.put_u16(status);
                eb.put_u32(blocked_on);
            }
            SchedEvent::Shutdown => {}
        }
    }
}

/// Spark (speculative work) events, attributed to the posting capability.
#[derive(Clone, Copy, Debug)]
pub enum SparkEvent {
    Create,
    Dud,
    Overflow,
    Run,
    Fizzle,
    Gc,
    /// A spark was stolen from `victim`.
    Steal { victim: CapNo },
    CreateThread { thread: ThreadId },
}

impl SparkEvent {
    pub(crate) fn tag(self) -> Tag {
        match self {
            SparkEvent::Create => Tag::SparkCreate,
            SparkEvent::Dud => Tag::SparkDud,
            SparkEvent::Overflow => Tag::SparkOverflow,
            SparkEvent::Run => Tag::SparkRun,
            SparkEvent::Fizzle => Tag::SparkFizzle,
            SparkEvent::Gc => Tag::SparkGc,
            SparkEvent::Steal { .. } => Tag::SparkSteal,
            SparkEvent::CreateThread { .. } => Tag::CreateSparkThread,
        }
    }

    pub(crate) fn put_payload(self, eb: &mut EventsBuf) {
        match self {
            SparkEvent::Steal { victim } => eb.put_u16(victim),
            SparkEvent::CreateThread { thread } => eb.put_u32(thread),
            _ => {}
        }
    }
}

/// Garbage-collection phase events, attributed to the posting capability.
#[derive(Clone, Copy, Debug)]
pub enum GcEvent {
    RequestSeq,
    RequestPar,
    Start,
    End,
    Idle,
    Work,
    Done,
}

impl GcEvent {
    pub(crate) fn tag(self) -> Tag {
        match self {
            GcEvent::RequestSeq => Tag::RequestSeqGc,
            GcEvent::RequestPar => Tag::RequestParGc,
            GcEvent::Start => Tag::GcStart,
            GcEvent::End => Tag::GcEnd,
            GcEvent::Idle => Tag::GcIdle,
            GcEvent::Work => Tag::GcWork,
            GcEvent::Done => Tag::GcDone,
        }
    }
}

/// What a capability set groups.
#[derive(Clone, Copy, Debug)]
#[repr(u16)]
pub enum CapsetType {
    Custom = 1,
    OsProcess = 2,
    ClockDomain = 3,
}

/// Capability-set events. These carry no producer and go through the
/// shared buffer; the capset id is passed alongside.
#[derive(Clone, Copy, Debug)]
pub enum CapsetEvent {
    Create { ty: CapsetType },
    Delete,
    AssignCap { cap: CapNo },
    RemoveCap { cap: CapNo },
    Pid { pid: u32 },
    Ppid { pid: u32 },
}

impl CapsetEvent {
    pub(crate) fn tag(self) -> Tag {
        match self {
            CapsetEvent::Create { .. } => Tag::CapsetCreate,
            CapsetEvent::Delete => Tag::CapsetDelete,
            CapsetEvent::AssignCap { .. } => Tag::CapsetAssignCap,
            CapsetEvent::RemoveCap { .. } => Tag::CapsetRemoveCap,
            CapsetEvent::Pid { .. } => Tag::OsProcessPid,
            CapsetEvent::Ppid { .. } => Tag::OsProcessPpid,
        }
    }

    /// Payload after the leading capset id, which the caller writes.
    pub(crate) fn put_payload(self, eb: &mut EventsBuf) {
        match self {
            CapsetEvent::Create { ty } => eb.put_u16(ty as u16),
            CapsetEvent::Delete => {}
            CapsetEvent::AssignCap { cap } | CapsetEvent::RemoveCap { cap } => eb.put_u16(cap),
            CapsetEvent::Pid { pid } | CapsetEvent::Ppid { pid } => eb.put_u32(pid),
        }
    }
}

/// Spark pool statistics for one capability.
#[derive(Clone, Copy, Debug, Default)]
pub struct SparkCounters {
    pub created: u64,
    pub dud: u64,
    pub overflowed: u64,
    pub converted: u64,
    pub gcd: u64,
    pub fizzled: u64,
}

/// Debug-metadata tags accepted by the raw debug post surface.
#[derive(Clone, Copy, Debug)]
pub enum DebugTag {
    Module,
    Procedure,
    Source,
    Core,
    Name,
    PtrRange,
}

impl DebugTag {
    pub(crate) fn tag(self) -> Tag {
        match self {
            DebugTag::Module => Tag::DebugModule,
            DebugTag::Procedure => Tag::DebugProcedure,
            DebugTag::Source => Tag::DebugSource,
            DebugTag::Core => Tag::DebugCore,
            DebugTag::Name => Tag::DebugName,
            DebugTag::PtrRange => Tag::DebugPtrRange,
        }
    }
}
