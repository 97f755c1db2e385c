//! Hand-maintained subset of the perf ABI.
//!
//! Everything here exists in `include/uapi/linux/perf_event.h` (and
//! `asm-generic/fcntl.h` / `asm-generic/siginfo.h`) since Linux 4.0, so a
//! small hand-kept copy beats generated bindings for the handful of
//! definitions this crate touches.

#![allow(non_camel_case_types)]
#![allow(dead_code)]

/// `struct perf_event_attr`, first ABI revision (`PERF_ATTR_SIZE_VER0`,
/// 64 bytes). The kernel accepts any published size in `size`; nothing
/// this crate configures lives past the first revision.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// Union with `sample_freq`; this crate samples by period only.
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    /// The kernel's option bitfield; see the `ATTR_*` bits below.
    pub flags: u64,
    /// Union with `wakeup_watermark`.
    pub wakeup_events: u32,
    pub bp_type: u32,
}

pub const PERF_ATTR_SIZE_VER0: u32 = 64;

// Bits of `perf_event_attr.flags`, in the kernel's bitfield order.
pub const ATTR_DISABLED: u64 = 1 << 0;
pub const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_EXCLUDE_HV: u64 = 1 << 6;

// perf_type_id
pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;

// perf_hw_id
pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;

// perf_hw_cache_id / op / result, combined as
// `id | (op << 8) | (result << 16)`.
pub const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
pub const PERF_COUNT_HW_CACHE_LL: u64 = 2;
pub const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
pub const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
pub const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

// perf_event_read_format
pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;

// perf ioctl ops (`_IO('$', n)`)
pub const PERF_IOC_OP_ENABLE: u64 = 0x2400;
pub const PERF_IOC_OP_DISABLE: u64 = 0x2401;
pub const PERF_IOC_OP_RESET: u64 = 0x2403;

// perf_event_open flags
pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// fcntl ops for signal-driven I/O that the libc crate does not bind on
// every target.
pub const F_SETSIG: i32 = 10;
pub const F_SETOWN_EX: i32 = 15;
pub const F_OWNER_TID: i32 = 0;

#[repr(C)]
pub struct f_owner_ex {
    pub type_: i32,
    pub pid: i32,
}

/// The POLL shape of `siginfo_t` on 64-bit Linux: three ints, padding to
/// the union, then `si_band` and `si_fd`. Used to pull `si_fd` out of an
/// I/O signal, which the libc crate does not expose.
#[repr(C)]
pub struct siginfo_poll {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    _pad: i32,
    pub si_band: i64,
    pub si_fd: i32,
}
