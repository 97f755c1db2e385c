//! Event-log lifecycle: file management, the buffer pool and the
//! shared-buffer post surface.
//!
//! [`EventLog::init`] opens the log file, emits the self-describing
//! header through the shared buffer and hands out one [`CapBuffer`] per
//! capability. Per-capability posts are lock-free (each worker owns its
//! buffer); everything not attributed to a capability posts through the
//! shared buffer under its mutex.

pub(crate) mod buf;
mod post;
#[cfg(test)]
mod test;

use std::fs::File;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

pub use post::CapBuffer;

use crate::config::WriterConfig;
use crate::event::{
    self, CapNo, CapsetEvent, CapsetId, DebugTag, Tag, Timestamp, DATA_BEGIN, ET_BEGIN, ET_END,
    HEADER_BEGIN, HEADER_END, HET_BEGIN, HET_END, SHARED_CAP,
};
use buf::EventsBuf;
use post::Post;

/// Buffers below this size cannot hold a block marker plus a reasonable
/// event, so configured capacities are clamped up to it.
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Errors that make event logging unusable. The hosting runtime should
/// treat them as fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open event log {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The tag table does not cover every slot below
    /// [`NUM_TAGS`][event::NUM_TAGS].
    #[error("event tag table is out of sync with the tag numbering")]
    TagTable,
}

/// State shared between the lifecycle handle and every capability buffer:
/// the log file, the elapsed-time origin and the flush counter.
pub(crate) struct LogCore {
    file: Mutex<File>,
    start: Instant,
    flushes: AtomicU64,
}

impl LogCore {
    /// Nanoseconds since logging started; the timestamp of every event.
    pub fn now_ns(&self) -> Timestamp {
        self.start.elapsed().as_nanos() as Timestamp
    }

    /// Closes the open block, writes the buffer to the file in a single
    /// call and resets it, opening a fresh block unless `reopen` is off.
    ///
    /// A short or failed write leaves the buffer intact (minus the block
    /// now being closed) so the data is retried on the next flush; the
    /// failure is reported, not propagated, because posting is best-effort.
    pub fn write_and_reset(&self, eb: &mut EventsBuf, reopen: bool) {
        eb.close_block(self.now_ns());
        if eb.is_empty() {
            return;
        }
        {
            let mut file = self.file.lock().unwrap();
            let bytes = eb.bytes();
            match file.write(bytes) {
                Ok(n) if n == bytes.len() => {}
                Ok(n) => {
                    log::error!("event log write came up short: {n} of {} bytes", bytes.len());
                    return;
                }
                Err(e) => {
                    log::error!("event log write failed: {e}");
                    return;
                }
            }
        }
        eb.reset();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if reopen {
            eb.open_block(self.now_ns());
        }
    }
}

/// The event log.
///
/// Created once by [`init`][Self::init]; torn down by [`end`][Self::end]
/// (clean) or [`abort`][Self::abort] (no end-of-data marker). Buffer
/// memory and the file handle are released when the last handle drops.
pub struct EventLog {
    core: Arc<LogCore>,
    shared: Mutex<EventsBuf>,
    buffer_capacity: usize,
    path: PathBuf,
}

impl EventLog {
    /// Opens `<program>.eventlog` (or `<program>.<pid>.eventlog` for a
    /// post-fork child), writes the header and the data-begin marker, and
    /// returns the log plus one buffer per capability, each with an open
    /// block.
    pub fn init(cfg: WriterConfig, n_caps: u16) -> Result<(EventLog, Vec<CapBuffer>), Error> {
        if !event::table_is_complete() {
            return Err(Error::TagTable);
        }

        let capacity = cfg.buffer_capacity.max(MIN_BUFFER_CAPACITY);

        let mut name = cfg.program.into_os_string();
        if cfg.forked {
            // The parent already logs to the plain name.
            name.push(format!(".{}", std::process::id()));
        }
        name.push(".eventlog");
        let path = PathBuf::from(name);

        let file = File::create(&path).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;
        let core = Arc::new(LogCore {
            file: Mutex::new(file),
            start: Instant::now(),
            flushes: AtomicU64::new(0),
        });

        let mut shared = EventsBuf::new(capacity, SHARED_CAP);
        write_header(&core, &mut shared);
        // Push the header and data-begin marker out, then open the shared
        // buffer's first block.
        core.write_and_reset(&mut shared, true);

        let caps = (0..n_caps)
            .map(|c| CapBuffer::new(Arc::clone(&core), capacity, c))
            .collect();

        let log = EventLog {
            core,
            shared: Mutex::new(shared),
            buffer_capacity: capacity,
            path,
        };
        Ok((log, caps))
    }

    /// Grows the buffer pool when the capability count rises from `from`
    /// to `to`. Existing buffers are untouched; the new ones come back
    /// with open blocks, ready for posting.
    pub fn more_cap_buffers(&self, from: CapNo, to: CapNo) -> Vec<CapBuffer> {
        (from..to)
            .map(|c| CapBuffer::new(Arc::clone(&self.core), self.buffer_capacity, c))
            .collect()
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How many buffer flushes have reached the file so far.
    pub fn flush_count(&self) -> u64 {
        self.core.flushes.load(Ordering::Relaxed)
    }

    /// Flushes the shared buffer and pushes the file to the OS.
    pub fn flush(&self) -> io::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        self.core.write_and_reset(&mut shared, true);
        drop(shared);
        let file = self.core.file.lock().unwrap();
        file.sync_data()
    }

    /// Ends logging cleanly: flushes every buffer, writes the end-of-data
    /// marker and closes the file.
    ///
    /// The shared buffer is reset rather than reopened, so nothing
    /// follows the marker.
    pub fn end(self, caps: Vec<CapBuffer>) -> io::Result<()> {
        for mut cap in caps {
            cap.flush();
        }
        let mut shared = self.shared.lock().unwrap();
        self.core.write_and_reset(&mut shared, false);
        shared.put_u16(event::DATA_END);
        self.core.write_and_reset(&mut shared, false);
        drop(shared);
        let file = self.core.file.lock().unwrap();
        file.sync_all()
    }

    /// Tears logging down without a clean end-of-data marker. Buffered
    /// events that were never flushed are lost.
    pub fn abort(self, caps: Vec<CapBuffer>) {
        drop(caps);
    }

    fn with_shared(&self, f: impl FnOnce(&mut Post)) {
        let mut eb = self.shared.lock().unwrap();
        let mut post = Post {
            core: &self.core,
            eb: &mut eb,
        };
        f(&mut post);
    }

    /// Announces the capability count.
    pub fn post_startup(&self, n_caps: u16) {
        self.with_shared(|p| p.startup(n_caps));
    }

    pub fn post_capset_event(&self, capset: CapsetId, ev: CapsetEvent) {
        self.with_shared(|p| p.capset(capset, ev));
    }

    /// Records the runtime's name and version string.
    pub fn post_rts_identifier(&self, capset: CapsetId, ident: &str) {
        self.with_shared(|p| p.capset_str(Tag::RtsIdentifier, capset, ident));
    }

    pub fn post_program_args<S: AsRef<str>>(&self, capset: CapsetId, args: &[S]) {
        self.with_shared(|p| p.capset_vec(Tag::ProgramArgs, capset, args));
    }

    pub fn post_program_env<S: AsRef<str>>(&self, capset: CapsetId, env: &[S]) {
        self.with_shared(|p| p.capset_vec(Tag::ProgramEnv, capset, env));
    }

    /// Records a consistent (wall clock, log clock) pair so readers can
    /// align this log with wall-clock time.
    pub fn post_wall_clock_time(&self, capset: CapsetId) {
        self.with_shared(|p| p.wall_clock_time(capset));
    }

    /// Posts a formatted runtime message not owned by any capability.
    pub fn post_msg(&self, args: std::fmt::Arguments) {
        self.with_shared(|p| p.msg(Tag::LogMsg, args));
    }

    /// Records coverage metadata for one module.
    pub fn post_hpc_module(&self, module: &str, tick_count: u32, hash: u32) {
        self.with_shared(|p| p.hpc_module(module, tick_count, hash));
    }

    /// Posts pre-serialized debug metadata under the given debug tag.
    /// Fixed-size debug tags must arrive with exactly the declared size.
    pub fn post_debug_data(&self, tag: DebugTag, data: &[u8]) {
        self.with_shared(|p| p.debug_data(tag, data));
    }

    pub fn post_debug_module(&self, name: &str) {
        self.with_shared(|p| p.debug_module(name));
    }

    pub fn post_debug_proc(&self, label: &str) {
        self.with_shared(|p| p.debug_proc(label));
    }

    /// Records the address range a procedure's code occupies.
    pub fn post_proc_ptr_range(&self, low: u64, high: u64) {
        self.with_shared(|p| p.proc_ptr_range(low, high));
    }

    /// Posts instruction-pointer samples for `capno` through the shared
    /// buffer, for callers that do not own the capability's buffer.
    pub fn post_instr_ptr_sample(&self, capno: CapNo, ips: &[u64]) {
        self.with_shared(|p| p.instr_ptr_sample(capno, ips));
    }
}

/// Emits the header: begin marker, the event-type table (one framed entry
/// per live tag), end marker and the data-begin marker. Flushes without
/// reopening a block if the buffer runs out of room mid-header.
fn write_header(core: &LogCore, eb: &mut EventsBuf) {
    fn ensure(core: &LogCore, eb: &mut EventsBuf, n: usize) {
        if !eb.has_raw_room(n) {
            core.write_and_reset(eb, false);
        }
    }

    ensure(core, eb, 8);
    eb.put_u32(HEADER_BEGIN);
    eb.put_u32(HET_BEGIN);

    for tag in Tag::all() {
        let desc = tag.desc();
        // ET_BEGIN, num, size, desclen, desc, extension length, ET_END.
        ensure(core, eb, 4 + 2 + 2 + 4 + desc.len() + 4 + 4);
        eb.put_u32(ET_BEGIN);
        eb.put_u16(tag as u16);
        eb.put_u16(tag.size().on_wire());
        eb.put_u32(desc.len() as u32);
        eb.put_bytes(desc.as_bytes());
        eb.put_u32(0); // no extensions
        eb.put_u32(ET_END);
    }

    ensure(core, eb, 12);
    eb.put_u32(HET_END);
    eb.put_u32(HEADER_END);
    eb.put_u32(DATA_BEGIN);
}
