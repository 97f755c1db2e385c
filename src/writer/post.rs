use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::buf::EventsBuf;
use super::LogCore;
use crate::event::{
    CapNo, CapsetEvent, CapsetId, DebugTag, GcEvent, PayloadSize, SchedEvent, SparkCounters,
    SparkEvent, Tag, ThreadId,
};

/// On-stack scratch for formatted messages; longer messages clamp here.
pub(crate) const MSG_SCRATCH_BYTES: usize = 512;

pub(crate) struct Scratch {
    buf: [u8; MSG_SCRATCH_BYTES],
    len: usize,
}

impl Scratch {
    pub fn format(args: fmt::Arguments) -> Self {
        let mut scratch = Self {
            buf: [0; MSG_SCRATCH_BYTES],
            len: 0,
        };
        // The clamping writer never reports an error.
        let _ = fmt::write(&mut scratch, args);
        scratch
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for Scratch {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let take = (MSG_SCRATCH_BYTES - self.len).min(s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn wall_clock() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

/// One post operation's view of a buffer plus the log core.
///
/// Both the per-capability and the shared-buffer surface funnel through
/// here, so room checking, header layout and payload encoding exist once.
pub(crate) struct Post<'a> {
    pub core: &'a LogCore,
    pub eb: &'a mut EventsBuf,
}

impl Post<'_> {
    /// Flushes to make room for a fixed-size event. Any fixed event fits
    /// an empty buffer, so this only fails if a flush could not reopen.
    fn ensure_room(&mut self, tag: Tag) -> bool {
        if !self.eb.has_room(tag) {
            self.core.write_and_reset(self.eb, true);
        }
        self.eb.has_room(tag)
    }

    /// Flushes to make room for a variable-size event. Events too large
    /// for any buffer are dropped whole, with a diagnostic.
    fn ensure_room_variable(&mut self, payload_bytes: usize) -> bool {
        // There is no way to write a length above 16 bits.
        if payload_bytes > u16::MAX as usize {
            log::error!("dropping oversized event of {payload_bytes} payload bytes");
            return false;
        }
        if !self.eb.has_room_variable(payload_bytes) {
            self.core.write_and_reset(self.eb, true);
            if !self.eb.has_room_variable(payload_bytes) {
                log::error!(
                    "dropping event of {payload_bytes} payload bytes: larger than the event buffer"
                );
                return false;
            }
        }
        true
    }

    fn fixed(&mut self, tag: Tag, payload: impl FnOnce(&mut EventsBuf)) {
        if !self.ensure_room(tag) {
            return;
        }
        self.eb.put_event_header(tag, self.core.now_ns());
        let at = self.eb.bytes().len();
        payload(self.eb);
        debug_assert_eq!(
            PayloadSize::Fixed((self.eb.bytes().len() - at) as u16),
            tag.size(),
            "payload does not match the declared size of {tag:?}",
        );
    }

    fn variable(&mut self, tag: Tag, payload_bytes: usize, payload: impl FnOnce(&mut EventsBuf)) {
        if !self.ensure_room_variable(payload_bytes) {
            return;
        }
        self.eb.put_event_header(tag, self.core.now_ns());
        self.eb.put_u16(payload_bytes as u16);
        let at = self.eb.bytes().len();
        payload(self.eb);
        debug_assert_eq!(self.eb.bytes().len() - at, payload_bytes);
    }

    pub fn sched(&mut self, ev: SchedEvent) {
        self.fixed(ev.tag(), |eb| ev.put_payload(eb));
    }

    pub fn spark(&mut self, ev: SparkEvent) {
        self.fixed(ev.tag(), |eb| ev.put_payload(eb));
    }

    pub fn gc(&mut self, ev: GcEvent) {
        self.fixed(ev.tag(), |_| {});
    }

    pub fn spark_counters(&mut self, c: SparkCounters, remaining: u64) {
        self.fixed(Tag::SparkCounters, |eb| {
            eb.put_u64(c.created);
            eb.put_u64(c.dud);
            eb.put_u64(c.overflowed);
            eb.put_u64(c.converted);
            eb.put_u64(c.gcd);
            eb.put_u64(c.fizzled);
            eb.put_u64(remaining);
        });
    }

    pub fn startup(&mut self, n_caps: u16) {
        self.fixed(Tag::Startup, |eb| eb.put_u16(n_caps));
    }

    pub fn capset(&mut self, capset: CapsetId, ev: CapsetEvent) {
        self.fixed(ev.tag(), |eb| {
            eb.put_u32(capset);
            ev.put_payload(eb);
        });
    }

    pub fn wall_clock_time(&mut self, capset: CapsetId) {
        // Readers align this log's timestamps with wall-clock time (and
        // with other processes' logs) through this event, so the two
        // clocks are read back to back and the captured timestamp is
        // written out instead of a fresh one.
        let (sec, nsec) = wall_clock();
        let ts = self.core.now_ns();
        if !self.ensure_room(Tag::WallClockTime) {
            return;
        }
        self.eb.put_event_header(Tag::WallClockTime, ts);
        self.eb.put_u32(capset);
        self.eb.put_u64(sec);
        self.eb.put_u32(nsec);
    }

    pub fn msg(&mut self, tag: Tag, args: fmt::Arguments) {
        let msg = Scratch::format(args);
        self.variable(tag, msg.bytes().len(), |eb| eb.put_bytes(msg.bytes()));
    }

    pub fn thread_label(&mut self, thread: ThreadId, label: &str) {
        self.variable(Tag::ThreadLabel, 4 + label.len(), |eb| {
            eb.put_u32(thread);
            eb.put_bytes(label.as_bytes());
        });
    }

    pub fn instr_ptr_sample(&mut self, capno: CapNo, ips: &[u64]) {
        self.variable(Tag::InstrPtrSample, 2 + 8 * ips.len(), |eb| {
            eb.put_u16(capno);
            for &ip in ips {
                eb.put_u64(ip);
            }
        });
    }

    pub fn capset_str(&mut self, tag: Tag, capset: CapsetId, s: &str) {
        self.variable(tag, 4 + s.len(), |eb| {
            eb.put_u32(capset);
            eb.put_bytes(s.as_bytes());
        });
    }

    pub fn capset_vec<S: AsRef<str>>(&mut self, tag: Tag, capset: CapsetId, items: &[S]) {
        // Every item ends in NUL, doubling as the separator.
        let size = 4 + items.iter().map(|s| s.as_ref().len() + 1).sum::<usize>();
        self.variable(tag, size, |eb| {
            eb.put_u32(capset);
            for s in items {
                eb.put_bytes(s.as_ref().as_bytes());
                eb.put_u8(0);
            }
        });
    }

    pub fn hpc_module(&mut self, module: &str, tick_count: u32, hash: u32) {
        self.variable(Tag::HpcModule, module.len() + 12, |eb| {
            eb.put_bytes(module.as_bytes());
            eb.put_u32(tick_count);
            eb.put_u32(hash);
            eb.put_u32(0);
        });
    }

    pub fn debug_data(&mut self, tag: DebugTag, data: &[u8]) {
        let tag = tag.tag();
        match tag.size() {
            PayloadSize::Fixed(n) => {
                if data.len() != n as usize {
                    debug_assert!(
                        false,
                        "debug data for {tag:?} has {} bytes, expected {n}",
                        data.len(),
                    );
                    log::error!("dropping debug data for {tag:?}: {} bytes, expected {n}", data.len());
                    return;
                }
                self.fixed(tag, |eb| eb.put_bytes(data));
            }
            PayloadSize::Variable => self.variable(tag, data.len(), |eb| eb.put_bytes(data)),
        }
    }

    pub fn debug_module(&mut self, name: &str) {
        self.variable(Tag::DebugModule, name.len() + 1, |eb| {
            eb.put_bytes(name.as_bytes());
            eb.put_u8(0);
        });
    }

    pub fn debug_proc(&mut self, label: &str) {
        // Module and procedure ids are resolved by the offline tooling.
        self.variable(Tag::DebugProcedure, 2 + 2 + label.len() + 1, |eb| {
            eb.put_u16(0xffff);
            eb.put_u16(0xffff);
            eb.put_bytes(label.as_bytes());
            eb.put_u8(0);
        });
    }

    pub fn proc_ptr_range(&mut self, low: u64, high: u64) {
        self.fixed(Tag::DebugPtrRange, |eb| {
            eb.put_u64(low);
            eb.put_u64(high);
        });
    }
}

/// A capability's private event buffer.
///
/// The owning worker is the only producer, so posting takes no lock and
/// issues no I/O until the buffer fills. Flushes close the open block,
/// write the buffer to the log file in one call, and open a fresh block.
pub struct CapBuffer {
    eb: EventsBuf,
    core: Arc<LogCore>,
}

impl CapBuffer {
    pub(crate) fn new(core: Arc<LogCore>, capacity: usize, capno: CapNo) -> Self {
        let mut eb = EventsBuf::new(capacity, capno);
        eb.open_block(core.now_ns());
        Self { eb, core }
    }

    fn post(&mut self) -> Post<'_> {
        Post {
            core: &self.core,
            eb: &mut self.eb,
        }
    }

    /// The capability this buffer belongs to.
    pub fn cap_no(&self) -> CapNo {
        self.eb.capno()
    }

    pub fn post_sched_event(&mut self, ev: SchedEvent) {
        self.post().sched(ev);
    }

    pub fn post_spark_event(&mut self, ev: SparkEvent) {
        self.post().spark(ev);
    }

    pub fn post_gc_event(&mut self, ev: GcEvent) {
        self.post().gc(ev);
    }

    pub fn post_spark_counters(&mut self, counters: SparkCounters, remaining: u64) {
        self.post().spark_counters(counters, remaining);
    }

    /// Posts a formatted runtime log message, e.g.
    /// `cap.post_cap_msg(format_args!("worker {} up", 0))`.
    ///
    /// Messages format into a fixed 512-byte scratch buffer and clamp
    /// there; nothing allocates on this path.
    pub fn post_cap_msg(&mut self, args: fmt::Arguments) {
        self.post().msg(Tag::LogMsg, args);
    }

    /// Like [`post_cap_msg`][Self::post_cap_msg], but tagged as a user
    /// (program-level) message.
    pub fn post_user_msg(&mut self, args: fmt::Arguments) {
        self.post().msg(Tag::UserMsg, args);
    }

    pub fn post_thread_label(&mut self, thread: ThreadId, label: &str) {
        self.post().thread_label(thread, label);
    }

    /// Posts drained instruction-pointer samples for this capability.
    pub fn post_instr_ptr_sample(&mut self, ips: &[u64]) {
        let capno = self.eb.capno();
        self.post().instr_ptr_sample(capno, ips);
    }

    /// Closes the open block, writes the buffer out and starts a new block.
    pub fn flush(&mut self) {
        self.core.write_and_reset(&mut self.eb, true);
    }
}
