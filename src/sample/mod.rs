//! Instruction-pointer sampling.
//!
//! The sampling counter of a worker's mutator set delivers an I/O signal
//! to the worker thread each time it overflows its period. The handler
//! runs in asynchronous signal context and must therefore do almost
//! nothing: map the signalling fd to the worker's sample ring, read the
//! interrupted instruction pointer out of the signal context, append it.
//! No allocation, no locks, no posting.
//!
//! The ring is split along that line: the hot half (`ips` and the length
//! word) is touched from signal context, while draining into the event
//! log is done by the producer alone, with the sampling counter stopped.


use std::cell::{Cell, UnsafeCell};
use std::fs::File;
use std::io::Result;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use crate::ffi::bindings as b;
use crate::ffi::syscall::{fcntl_arg, fcntl_argp};

/// Ring capacity; samples past this are dropped until the next drain.
pub const SAMPLE_MAX: usize = 1024;
/// A drain below this many samples posts nothing and keeps accumulating.
pub const SAMPLE_MIN: usize = 256;

/// Size of the direct-indexed fd-to-ring table. Perf hands out low fd
/// numbers early in a process's life, so nearly every lookup hits here;
/// larger fds fall back to the thread-local slot.
const FD_RING_MAP_SIZE: usize = 128;

static RING_MAP: [AtomicPtr<SampleRing>; FD_RING_MAP_SIZE] =
    [const { AtomicPtr::new(ptr::null_mut()) }; FD_RING_MAP_SIZE];

thread_local! {
    static CURRENT_RING: Cell<*const SampleRing> = const { Cell::new(ptr::null()) };
}

/// A worker's instruction-pointer ring.
///
/// Written only by the overflow handler, which the kernel delivers on the
/// owning thread (`F_SETOWN_EX` with the worker's tid); drained only by
/// that same thread with the sampling counter stopped. The two halves
/// never overlap, the atomics order the length word against the slots.
pub(crate) struct SampleRing {
    ips: UnsafeCell<[u64; SAMPLE_MAX]>,
    len: AtomicUsize,
}

// Slot writes and reads are ordered through `len`; see the struct docs
// for why they cannot overlap.
unsafe impl Sync for SampleRing {}

impl SampleRing {
    pub fn new() -> Self {
        Self {
            ips: UnsafeCell::new([0; SAMPLE_MAX]),
            len: AtomicUsize::new(0),
        }
    }

    /// Appends one sample. Async-signal-safe; drops the sample when the
    /// ring is full.
    fn push(&self, ip: u64) {
        let n = self.len.load(Ordering::Relaxed);
        if n < SAMPLE_MAX {
            unsafe { (*self.ips.get())[n] = ip };
            self.len.store(n + 1, Ordering::Release);
        }
    }

    /// Hands the accumulated samples to `sink` and clears the ring, if at
    /// least [`SAMPLE_MIN`] have gathered. Returns whether it drained.
    ///
    /// Only call with the sampling counter stopped.
    pub fn drain(&self, sink: impl FnOnce(&[u64])) -> bool {
        let n = self.len.load(Ordering::Acquire);
        if n < SAMPLE_MIN {
            return false;
        }
        sink(unsafe { &(&*self.ips.get())[..n] });
        self.len.store(0, Ordering::Release);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

/// Installs the overflow signal handler once per process.
pub(crate) fn install_overflow_handler() -> Result<()> {
    static INSTALL: Once = Once::new();
    let mut result = Ok(());
    INSTALL.call_once(|| unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = overflow_handler as *const () as usize;
        act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        if libc::sigaction(libc::SIGIO, &act, ptr::null_mut()) == -1 {
            result = Err(std::io::Error::last_os_error());
        }
    });
    result
}

/// Routes the sampling fd's overflow signals to the calling thread.
pub(crate) fn arm_sigio(file: &File) -> Result<()> {
    let flags = fcntl_arg(file, libc::F_GETFL, 0)?;
    fcntl_arg(file, libc::F_SETFL, flags | libc::O_ASYNC)?;
    // With F_SETSIG in place the kernel fills in si_fd, which is how the
    // handler finds the ring.
    fcntl_arg(file, b::F_SETSIG, libc::SIGIO)?;
    let mut owner = b::f_owner_ex {
        type_: b::F_OWNER_TID,
        pid: unsafe { libc::gettid() } as i32,
    };
    fcntl_argp(file, b::F_SETOWN_EX, &mut owner)?;
    Ok(())
}

/// Points the overflow handler at `ring` for the given sampling fd. Must
/// run on the worker thread the fd signals.
pub(crate) fn register(file: &File, ring: &Arc<SampleRing>) {
    let ptr = Arc::as_ptr(ring);
    let fd = file.as_raw_fd() as usize;
    if fd < FD_RING_MAP_SIZE {
        RING_MAP[fd].store(ptr as *mut SampleRing, Ordering::Release);
    }
    CURRENT_RING.with(|c| c.set(ptr));
}

/// Clears the handler's view of this fd's ring. Must run on the worker
/// thread, before the ring is dropped.
pub(crate) fn unregister(file: &File) {
    let fd = file.as_raw_fd() as usize;
    if fd < FD_RING_MAP_SIZE {
        RING_MAP[fd].store(ptr::null_mut(), Ordering::Release);
    }
    CURRENT_RING.with(|c| c.set(ptr::null()));
}

/// The overflow handler. Runs in asynchronous signal context.
extern "C" fn overflow_handler(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let fd = unsafe { (*(info as *const b::siginfo_poll)).si_fd };

    let mut ring = if (0..FD_RING_MAP_SIZE as i32).contains(&fd) {
        RING_MAP[fd as usize].load(Ordering::Acquire) as *const SampleRing
    } else {
        ptr::null()
    };
    if ring.is_null() {
        // The thread-local is const-initialized, so this does not
        // allocate; it only fails during thread teardown.
        ring = CURRENT_RING.try_with(|c| c.get()).unwrap_or(ptr::null());
    }
    // A lost sample beats corruption.
    if ring.is_null() {
        return;
    }

    let ip = unsafe { ip_from_ucontext(ctx) };
    unsafe { (*ring).push(ip) };
}

/// The instruction pointer the signal interrupted.
#[cfg(target_arch = "x86_64")]
unsafe fn ip_from_ucontext(ctx: *mut libc::c_void) -> u64 {
    let uc = &*(ctx as *const libc::ucontext_t);
    uc.uc_mcontext.gregs[libc::REG_RIP as usize] as u64
}

#[cfg(target_arch = "aarch64")]
unsafe fn ip_from_ucontext(ctx: *mut libc::c_void) -> u64 {
    let uc = &*(ctx as *const libc::ucontext_t);
    uc.uc_mcontext.pc
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn ip_from_ucontext(_ctx: *mut libc::c_void) -> u64 {
    0
}
