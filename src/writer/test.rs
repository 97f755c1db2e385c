use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder};
use tempfile::TempDir;

use super::post::MSG_SCRATCH_BYTES;
use super::*;
use crate::config::WriterConfig;
use crate::event::{
    CapsetType, GcEvent, SchedEvent, SparkCounters, SparkEvent, SIZE_VARIABLE,
};

fn small_config() -> (TempDir, WriterConfig) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = WriterConfig::new(dir.path().join("prog"));
    cfg.buffer_capacity = 4096;
    (dir, cfg)
}

// A minimal reader implementing the inverse of the wire grammar, used to
// check what the writer produced.

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u16(&mut self) -> u16 {
        let v = BigEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = BigEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = BigEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        v
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let b = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        b
    }
}

#[derive(Debug, Clone)]
struct ReadEvent {
    tag: u16,
    ts: u64,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct ReadBlock {
    capno: u16,
    start_ts: u64,
    end_ts: u64,
    events: Vec<ReadEvent>,
}

#[derive(Debug)]
struct ReadLog {
    schema: Vec<(u16, u16, String)>,
    blocks: Vec<ReadBlock>,
    loose: Vec<ReadEvent>,
    saw_data_end: bool,
}

impl ReadLog {
    /// Blocks that actually carry events; end-of-log flushes leave
    /// marker-only blocks behind.
    fn event_blocks(&self) -> impl Iterator<Item = &ReadBlock> {
        self.blocks.iter().filter(|b| !b.events.is_empty())
    }

    fn events_of_cap(&self, capno: u16) -> Vec<&ReadEvent> {
        self.blocks
            .iter()
            .filter(|b| b.capno == capno)
            .flat_map(|b| &b.events)
            .collect()
    }
}

fn parse_log(buf: &[u8]) -> ReadLog {
    let mut r = Reader::new(buf);

    assert_eq!(r.u32(), event::HEADER_BEGIN, "missing header-begin marker");
    assert_eq!(r.u32(), event::HET_BEGIN);
    let mut schema = Vec::new();
    loop {
        let marker = r.u32();
        if marker == event::HET_END {
            break;
        }
        assert_eq!(marker, event::ET_BEGIN);
        let num = r.u16();
        let size = r.u16();
        let desclen = r.u32() as usize;
        let desc = String::from_utf8(r.bytes(desclen).to_vec()).unwrap();
        assert_eq!(r.u32(), 0, "unexpected event-type extension");
        assert_eq!(r.u32(), event::ET_END);
        schema.push((num, size, desc));
    }
    assert_eq!(r.u32(), event::HEADER_END);
    assert_eq!(r.u32(), event::DATA_BEGIN);

    let sizes: HashMap<u16, u16> = schema.iter().map(|&(num, size, _)| (num, size)).collect();

    let mut blocks = Vec::new();
    let mut loose = Vec::new();
    let mut current: Option<(ReadBlock, usize)> = None;
    let mut saw_data_end = false;

    while r.remaining() >= 2 {
        if let Some((_, end)) = &current {
            if r.pos == *end {
                blocks.push(current.take().unwrap().0);
            } else {
                assert!(r.pos < *end, "event ran past its block boundary");
            }
        }

        let at = r.pos;
        let tag = r.u16();
        if tag == event::DATA_END {
            assert!(current.is_none(), "data end inside an open block");
            saw_data_end = true;
            break;
        }
        let ts = r.u64();

        if tag == Tag::BlockMarker as u16 {
            assert!(current.is_none(), "nested block marker");
            let size = r.u32();
            let end_ts = r.u64();
            let capno = r.u16();
            current = Some((
                ReadBlock {
                    capno,
                    start_ts: ts,
                    end_ts,
                    events: Vec::new(),
                },
                at + size as usize,
            ));
            continue;
        }

        let declared = *sizes.get(&tag).expect("tag missing from the header table");
        let payload = if declared == SIZE_VARIABLE {
            let n = r.u16() as usize;
            r.bytes(n).to_vec()
        } else {
            r.bytes(declared as usize).to_vec()
        };
        let ev = ReadEvent { tag, ts, payload };
        match &mut current {
            Some((block, _)) => block.events.push(ev),
            None => loose.push(ev),
        }
    }
    if let Some((block, end)) = current {
        assert_eq!(r.pos, end, "log ended inside a block");
        blocks.push(block);
    }
    assert_eq!(r.remaining(), 0, "trailing bytes after data end");

    ReadLog {
        schema,
        blocks,
        loose,
        saw_data_end,
    }
}

fn read_back(path: &PathBuf) -> ReadLog {
    parse_log(&fs::read(path).unwrap())
}

#[test]
fn test_init_only_stream_shape() {
    let (_dir, cfg) = small_config();
    let (log, caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();
    log.end(caps).unwrap();

    let log = read_back(&path);
    assert!(log.saw_data_end);
    assert!(log.loose.is_empty());
    assert_eq!(log.event_blocks().count(), 0);

    // The header enumerates exactly the live tags, in order, with their
    // declared sizes and descriptions.
    let expected: Vec<(u16, u16, String)> = Tag::all()
        .map(|t| (t as u16, t.size().on_wire(), t.desc().to_owned()))
        .collect();
    assert_eq!(log.schema, expected);
}

#[test]
fn test_single_create_thread() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    caps[0].post_sched_event(SchedEvent::CreateThread { thread: 42 });
    log.end(caps).unwrap();

    let log = read_back(&path);
    let with_events: Vec<_> = log.event_blocks().collect();
    assert_eq!(with_events.len(), 1);
    let block = with_events[0];
    assert_eq!(block.capno, 0);
    assert_eq!(block.events.len(), 1);
    let ev = &block.events[0];
    assert_eq!(ev.tag, Tag::CreateThread as u16);
    assert_eq!(ev.payload, [0, 0, 0, 42]);
    assert!(block.end_ts >= block.start_ts);
    assert!(ev.ts >= block.start_ts && ev.ts <= block.end_ts);
}

#[test]
fn test_flush_under_pressure_keeps_events_whole() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    // Far more 14-byte events than a 4 KiB buffer holds.
    let total = 1000u32;
    for thread in 0..total {
        caps[0].post_sched_event(SchedEvent::CreateThread { thread });
    }
    assert!(log.flush_count() >= 2, "posting never filled the buffer");
    log.end(caps).unwrap();

    let log = read_back(&path);
    assert!(log.event_blocks().count() >= 2, "expected multiple blocks");

    // Every event intact and in issue order, partitioned by block.
    let events = log.events_of_cap(0);
    assert_eq!(events.len(), total as usize);
    for (i, ev) in events.iter().enumerate() {
        assert_eq!(ev.tag, Tag::CreateThread as u16);
        assert_eq!(BigEndian::read_u32(&ev.payload), i as u32);
    }

    // Timestamps are non-decreasing within each block.
    for block in log.event_blocks() {
        let mut prev = block.start_ts;
        for ev in &block.events {
            assert!(ev.ts >= prev);
            prev = ev.ts;
        }
        assert!(block.end_ts >= prev);
    }
}

#[test]
fn test_log_msg_formats_into_payload() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    caps[0].post_cap_msg(format_args!("hello {}", 7));
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag, Tag::LogMsg as u16);
    assert_eq!(events[0].payload, b"hello 7");
}

#[test]
fn test_long_messages_clamp_at_scratch_size() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    let long = "x".repeat(2000);
    caps[0].post_user_msg(format_args!("{long}"));
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag, Tag::UserMsg as u16);
    assert_eq!(events[0].payload.len(), MSG_SCRATCH_BYTES);
    assert!(events[0].payload.iter().all(|&b| b == b'x'));
}

#[test]
fn test_wall_clock_pair_is_consistent() {
    use std::time::{SystemTime, UNIX_EPOCH};

    let (_dir, cfg) = small_config();
    let (log, caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    log.post_wall_clock_time(0);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(event::SHARED_CAP);
    assert_eq!(events.len(), 1);
    let ev = events[0];
    assert_eq!(ev.tag, Tag::WallClockTime as u16);
    assert_eq!(ev.payload.len(), 16);
    let capset = BigEndian::read_u32(&ev.payload[0..4]);
    let sec = BigEndian::read_u64(&ev.payload[4..12]);
    let nsec = BigEndian::read_u32(&ev.payload[12..16]);
    assert_eq!(capset, 0);
    assert!(now.abs_diff(sec) <= 2, "wall clock {sec} far from {now}");
    assert!(nsec < 1_000_000_000);
}

#[test]
fn test_shared_events_carry_the_shared_capno() {
    let (_dir, cfg) = small_config();
    let (log, caps) = EventLog::init(cfg, 2).unwrap();
    let path = log.path().to_path_buf();

    log.post_startup(2);
    log.post_capset_event(7, CapsetEvent::Create { ty: CapsetType::OsProcess });
    log.post_capset_event(7, CapsetEvent::AssignCap { cap: 1 });
    log.post_rts_identifier(7, "rt-eventlog-0.1");
    log.post_program_args(7, &["prog", "--fast"]);
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(event::SHARED_CAP);
    assert_eq!(events.len(), 5);

    assert_eq!(events[0].tag, Tag::Startup as u16);
    assert_eq!(events[0].payload, [0, 2]);

    assert_eq!(events[1].tag, Tag::CapsetCreate as u16);
    assert_eq!(events[1].payload, [0, 0, 0, 7, 0, 2]);

    assert_eq!(events[2].tag, Tag::CapsetAssignCap as u16);
    assert_eq!(events[2].payload, [0, 0, 0, 7, 0, 1]);

    assert_eq!(events[3].tag, Tag::RtsIdentifier as u16);
    assert_eq!(&events[3].payload[4..], b"rt-eventlog-0.1");

    assert_eq!(events[4].tag, Tag::ProgramArgs as u16);
    assert_eq!(&events[4].payload[4..], b"prog\0--fast\0");
}

#[test]
fn test_spark_events_and_counters() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    caps[0].post_spark_event(SparkEvent::Create);
    caps[0].post_spark_event(SparkEvent::Steal { victim: 3 });
    caps[0].post_spark_counters(
        SparkCounters {
            created: 1,
            dud: 2,
            overflowed: 3,
            converted: 4,
            gcd: 5,
            fizzled: 6,
        },
        7,
    );
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(0);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].tag, Tag::SparkCreate as u16);
    assert!(events[0].payload.is_empty());
    assert_eq!(events[1].tag, Tag::SparkSteal as u16);
    assert_eq!(events[1].payload, [0, 3]);
    assert_eq!(events[2].tag, Tag::SparkCounters as u16);
    let vals: Vec<u64> = events[2].payload.chunks(8).map(BigEndian::read_u64).collect();
    assert_eq!(vals, [1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn test_instr_ptr_sample_payload() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    caps[0].post_instr_ptr_sample(&[0x1000, 0x2000, 0x3000]);
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(0);
    assert_eq!(events.len(), 1);
    let ev = events[0];
    assert_eq!(ev.tag, Tag::InstrPtrSample as u16);
    assert_eq!(ev.payload.len(), 2 + 3 * 8);
    assert_eq!(BigEndian::read_u16(&ev.payload[0..2]), 0);
    let ips: Vec<u64> = ev.payload[2..].chunks(8).map(BigEndian::read_u64).collect();
    assert_eq!(ips, [0x1000, 0x2000, 0x3000]);
}

#[test]
fn test_debug_events() {
    let (_dir, cfg) = small_config();
    let (log, caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    log.post_debug_module("Main");
    log.post_debug_proc("main_entry");
    log.post_proc_ptr_range(0x400000, 0x401000);
    log.post_hpc_module("Main", 12, 0xfeed);
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(event::SHARED_CAP);
    assert_eq!(events.len(), 4);

    assert_eq!(events[0].tag, Tag::DebugModule as u16);
    assert_eq!(events[0].payload, b"Main\0");

    assert_eq!(events[1].tag, Tag::DebugProcedure as u16);
    assert_eq!(&events[1].payload[..4], [0xff, 0xff, 0xff, 0xff]);
    assert_eq!(&events[1].payload[4..], b"main_entry\0");

    assert_eq!(events[2].tag, Tag::DebugPtrRange as u16);
    assert_eq!(BigEndian::read_u64(&events[2].payload[0..8]), 0x400000);
    assert_eq!(BigEndian::read_u64(&events[2].payload[8..16]), 0x401000);

    assert_eq!(events[3].tag, Tag::HpcModule as u16);
    assert_eq!(&events[3].payload[..4], b"Main");
    assert_eq!(BigEndian::read_u32(&events[3].payload[4..8]), 12);
    assert_eq!(BigEndian::read_u32(&events[3].payload[8..12]), 0xfeed);
}

#[test]
fn test_oversize_events_are_dropped_whole() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    // Larger than the buffer: dropped.
    let big = "y".repeat(5000);
    caps[0].post_thread_label(9, &big);
    // Larger than a 16-bit length could express: dropped.
    let huge = "z".repeat(70_000);
    caps[0].post_thread_label(9, &huge);
    // The buffer must still be intact for ordinary traffic.
    caps[0].post_gc_event(GcEvent::Start);
    log.end(caps).unwrap();

    let log = read_back(&path);
    let events = log.events_of_cap(0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag, Tag::GcStart as u16);
}

#[test]
fn test_more_cap_buffers_extends_the_pool() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    let mut extra = log.more_cap_buffers(1, 3);
    assert_eq!(extra.len(), 2);
    assert_eq!(extra[0].cap_no(), 1);
    assert_eq!(extra[1].cap_no(), 2);

    caps[0].post_sched_event(SchedEvent::CreateThread { thread: 1 });
    extra[1].post_sched_event(SchedEvent::RunThread { thread: 1 });
    caps.append(&mut extra);
    log.end(caps).unwrap();

    let log = read_back(&path);
    assert_eq!(log.events_of_cap(0).len(), 1);
    assert_eq!(log.events_of_cap(2).len(), 1);
    assert_eq!(log.events_of_cap(2)[0].tag, Tag::RunThread as u16);
}

#[test]
fn test_abort_skips_the_end_marker() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    // Never flushed, so lost by abort.
    caps[0].post_sched_event(SchedEvent::CreateThread { thread: 1 });
    log.abort(caps);

    let log = read_back(&path);
    assert!(!log.saw_data_end);
    assert_eq!(log.event_blocks().count(), 0);
}

#[test]
fn test_forked_child_gets_pid_in_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = WriterConfig::new(dir.path().join("prog"));
    cfg.forked = true;
    let (log, caps) = EventLog::init(cfg, 1).unwrap();
    let name = log.path().file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(name, format!("prog.{}.eventlog", std::process::id()));
    log.end(caps).unwrap();
}

#[test]
fn test_round_trip_mixed_traffic() {
    let (_dir, cfg) = small_config();
    let (log, mut caps) = EventLog::init(cfg, 2).unwrap();
    let path = log.path().to_path_buf();

    for round in 0..200u32 {
        caps[0].post_sched_event(SchedEvent::RunThread { thread: round });
        caps[1].post_sched_event(SchedEvent::ThreadRunnable { thread: round });
        if round % 50 == 0 {
            log.post_capset_event(1, CapsetEvent::Delete);
            caps[0].post_thread_label(round, "worker");
        }
    }
    log.end(caps).unwrap();

    let log = read_back(&path);

    let cap0 = log.events_of_cap(0);
    assert_eq!(cap0.len(), 204);
    let runs: Vec<_> = cap0
        .iter()
        .filter(|ev| ev.tag == Tag::RunThread as u16)
        .collect();
    assert_eq!(runs.len(), 200);
    for (i, ev) in runs.iter().enumerate() {
        assert_eq!(BigEndian::read_u32(&ev.payload), i as u32);
    }

    let cap1 = log.events_of_cap(1);
    assert_eq!(cap1.len(), 200);
    assert_eq!(log.events_of_cap(event::SHARED_CAP).len(), 4);

    // Fixed events carry exactly their declared payload size.
    let sizes: HashMap<u16, u16> = log.schema.iter().map(|&(n, s, _)| (n, s)).collect();
    for block in log.event_blocks() {
        for ev in &block.events {
            let declared = sizes[&ev.tag];
            if declared != SIZE_VARIABLE {
                assert_eq!(ev.payload.len(), declared as usize);
            }
        }
    }
}

#[test]
fn test_explicit_flush_drains_the_shared_buffer() {
    let (_dir, cfg) = small_config();
    let (log, caps) = EventLog::init(cfg, 1).unwrap();
    let path = log.path().to_path_buf();

    log.post_startup(1);
    let before = log.flush_count();
    log.flush().unwrap();
    assert_eq!(log.flush_count(), before + 1);

    // The event is on disk even though the log is still open.
    let bytes = fs::read(&path).unwrap();
    let tag = (Tag::Startup as u16).to_be_bytes();
    assert!(bytes.windows(2).any(|w| w == tag));

    log.end(caps).unwrap();
    let log = read_back(&path);
    assert_eq!(log.events_of_cap(event::SHARED_CAP).len(), 1);
}
