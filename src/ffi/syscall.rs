//! The handful of kernel entry points the counter layer needs, shaped
//! around how this crate uses them: counters are always opened for the
//! calling thread, never grouped, and always read as the
//! `(value, time_enabled, time_running)` triple.

use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::os::fd::{AsRawFd, FromRawFd};

use super::bindings as b;
use super::Attr;

/// Opens one hardware counter for the calling thread on any CPU.
pub fn open_counter(attr: &Attr) -> Result<File> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr,
            0,  // calling thread
            -1, // any CPU
            -1, // no group leader
            b::PERF_FLAG_FD_CLOEXEC,
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(ret as _) })
}

fn counter_op(counter: &File, op: u64) -> Result<()> {
    if unsafe { libc::ioctl(counter.as_raw_fd(), op as _, 0) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Lets the counter accumulate.
pub fn enable(counter: &File) -> Result<()> {
    counter_op(counter, b::PERF_IOC_OP_ENABLE)
}

/// Stops the counter from accumulating; the count survives.
pub fn disable(counter: &File) -> Result<()> {
    counter_op(counter, b::PERF_IOC_OP_DISABLE)
}

/// Zeroes the count. Enabled/running times keep growing, which is what
/// lets accumulation scale multiplexed readings across resets.
pub fn reset(counter: &File) -> Result<()> {
    counter_op(counter, b::PERF_IOC_OP_RESET)
}

/// Reads the counter's `(value, time_enabled, time_running)` triple.
/// Every counter this crate opens asks for exactly this read format, and
/// the kernel serves it whole, so a short read is an error here rather
/// than something callers must loop over.
pub fn read_counts(counter: &File) -> Result<[u64; 3]> {
    let mut triple = [0u64; 3];
    let len = size_of_val(&triple);
    let got = unsafe { libc::read(counter.as_raw_fd(), triple.as_mut_ptr() as *mut _, len) };
    if got < 0 {
        return Err(Error::last_os_error());
    }
    if (got as usize) != len {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(triple)
}

pub fn fcntl_arg(file: &File, op: i32, arg: i32) -> Result<i32> {
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), op, arg) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(ret)
}

pub fn fcntl_argp<T>(file: &File, op: i32, argp: &mut T) -> Result<i32> {
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), op, argp as *mut T) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(ret)
}
