//! Fast binary event logging for multi-threaded runtimes.
//!
//! The writer streams time-stamped, typed events describing scheduler,
//! garbage-collector, spark, capability-set and sampling activity into a
//! self-describing binary log. Every worker ("capability") owns a private
//! event buffer and posts into it without taking any lock; buffers are
//! framed into per-producer blocks and flushed to the log file as a whole.
//! Events that belong to no particular capability go through one shared,
//! mutex-guarded buffer.
//!
//! A second instrumentation source is the hardware-counter layer in
//! [`count`]: per-worker counter sets over `perf_event_open` with
//! mutator/GC phase accounting, plus an instruction-pointer sampler whose
//! overflow handler runs in signal context and feeds the same log.
//!
//! ## Example
//!
//! Write a small log and shut it down cleanly:
//!
//! ```rust
//! use rt_eventlog::config::WriterConfig;
//! use rt_eventlog::event::{GcEvent, SchedEvent};
//! use rt_eventlog::writer::EventLog;
//!
//! let cfg = WriterConfig::new(std::env::temp_dir().join("demo"));
//! let (log, mut caps) = EventLog::init(cfg, 1).unwrap();
//!
//! log.post_startup(1);
//! caps[0].post_sched_event(SchedEvent::CreateThread { thread: 42 });
//! caps[0].post_gc_event(GcEvent::Start);
//! caps[0].post_gc_event(GcEvent::End);
//! caps[0].post_cap_msg(format_args!("worker {} up", 0));
//!
//! log.end(caps).unwrap();
//! ```
//!
//! The resulting file starts with a header that lists every event type and
//! its payload size, so readers need no out-of-band schema.

pub mod config;
pub mod count;
pub mod event;
mod ffi;
pub mod sample;
pub mod writer;
