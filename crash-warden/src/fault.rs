//! Process-wide fault interception.
//!
//! Armed only after a registration fully succeeds. The handler runs on the
//! faulting thread of a corrupted process, so it confines itself to raw
//! syscalls and atomics: publish the fault details into the pre-registered
//! [`FaultBlock`], signal dump-request, wait (bounded) for dump-done, then
//! hand the signal back to the default disposition so the process dies the
//! way it would have without us.

#![allow(unsafe_code)]

use crate::{debug_print, Error};
use std::{
    mem,
    os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd},
    ptr,
    sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering},
    time::Duration,
};

/// The fault signals we intercept.
#[derive(Copy, Clone, PartialEq)]
#[repr(i32)]
pub(crate) enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

const EXCEPTION_SIGNALS: [Signal; 6] = [
    Signal::Abort,
    Signal::Bus,
    Signal::Fpe,
    Signal::Illegal,
    Signal::Segv,
    Signal::Trap,
];

/// The dump trigger payload.
///
/// Lives on the heap of the monitored process at the address announced in
/// the registration request. The faulting thread fills in everything past
/// `process_id` right before it signals dump-request, then the supervisor
/// reads the block out of the (stopped or dead) process during capture.
#[derive(Copy, Clone)]
#[cfg_attr(test, derive(PartialEq, Debug))]
#[repr(C)]
pub struct FaultBlock {
    /// Always [`Self::MAGIC`], lets capture tooling validate what it read.
    pub tag: [u8; 8],
    /// Process id of the monitored process.
    pub process_id: u32,
    /// Thread that took the fault. Zero until a fault happens.
    pub faulting_thread: u32,
    /// The raised signal. Zero until a fault happens.
    pub signal: i32,
    /// `si_code` of the raised signal.
    pub code: i32,
    /// The faulting address, where the signal carries one.
    pub fault_address: u64,
    /// Address of the OS thread context at the time of the fault, only
    /// meaningful inside the faulted process's address space.
    pub context: u64,
}

impl FaultBlock {
    pub const MAGIC: [u8; 8] = *b"CWDNFLT1";

    pub fn new(process_id: u32) -> Self {
        Self {
            tag: Self::MAGIC,
            process_id,
            faulting_thread: 0,
            signal: 0,
            code: 0,
            fault_address: 0,
            context: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            let size = mem::size_of::<Self>();
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, size)
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != mem::size_of::<Self>() {
            return None;
        }

        unsafe { Some(ptr::read_unaligned(buf.as_ptr().cast::<Self>())) }
    }
}

// The rendezvous state the handler is allowed to touch. Descriptors are
// stored as raw values and the block as a raw pointer so the handler never
// takes a lock; [`install`]/[`detach`] are the only writers.
static DUMP_REQUEST: AtomicI32 = AtomicI32::new(-1);
static DUMP_DONE: AtomicI32 = AtomicI32::new(-1);
static FAULT_BLOCK: AtomicPtr<FaultBlock> = AtomicPtr::new(ptr::null_mut());
static RENDEZVOUS_MS: AtomicU64 = AtomicU64::new(0);

/// First faulting thread wins the rendezvous, any other faulting thread
/// waits for dump-done alongside it and then proceeds to termination.
static FAULT_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

static INSTALLED: parking_lot::Mutex<bool> = parking_lot::const_mutex(false);

/// Arms the process-wide fault handler with a successfully registered
/// rendezvous.
///
/// # Errors
///
/// Fails with [`Error::HandlerAlreadyInstalled`] if this process already
/// armed a handler, and leaves the existing one untouched.
pub(crate) fn install(
    dump_request: OwnedFd,
    dump_done: OwnedFd,
    block: Box<FaultBlock>,
    rendezvous_timeout: Duration,
) -> Result<(), Error> {
    let mut installed = INSTALLED.lock();

    if *installed {
        return Err(Error::HandlerAlreadyInstalled);
    }

    // SAFETY: syscalls
    unsafe { install_sigaltstack()? };

    // The rendezvous state has to be visible before any handler that could
    // observe it is installed.
    RENDEZVOUS_MS.store(rendezvous_timeout.as_millis() as u64, Ordering::Relaxed);
    DUMP_REQUEST.store(dump_request.into_raw_fd(), Ordering::Relaxed);
    DUMP_DONE.store(dump_done.into_raw_fd(), Ordering::Relaxed);
    FAULT_BLOCK.store(Box::into_raw(block), Ordering::Release);

    // SAFETY: syscalls
    unsafe { install_handlers() };

    *installed = true;

    Ok(())
}

/// Disarms the fault handler, restoring the previously installed or default
/// dispositions and releasing the rendezvous state.
pub(crate) fn detach() {
    let mut installed = INSTALLED.lock();

    if *installed {
        // SAFETY: syscalls
        unsafe {
            restore_sigaltstack();
            restore_handlers();
        }

        let block = FAULT_BLOCK.swap(ptr::null_mut(), Ordering::AcqRel);
        if !block.is_null() {
            // SAFETY: the pointer came out of Box::into_raw in install
            drop(unsafe { Box::from_raw(block) });
        }

        for fd in [&DUMP_REQUEST, &DUMP_DONE] {
            let fd = fd.swap(-1, Ordering::Relaxed);
            if fd >= 0 {
                // SAFETY: install leaked the descriptor into the atomic
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }

        *installed = false;
    }
}

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the alternate stack that is mapped when the handler is
/// installed.
///
/// This has a minimum size of 16k, which might seem a bit large, but this
/// memory will only ever be committed in case we actually get a stack
/// overflow, which is (hopefully) exceedingly rare.
const SIG_STACK_SIZE: usize = get_stack_size();

struct StackSave {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
}

unsafe impl Send for StackSave {}

static STACK_SAVE: parking_lot::Mutex<Option<StackSave>> = parking_lot::const_mutex(None);

/// Create an alternative stack to run the signal handler on. This is done
/// since the signal might have been caused by a stack overflow.
unsafe fn install_sigaltstack() -> Result<(), Error> {
    unsafe {
        // Check the existing sigaltstack, and if it exists and is big enough
        // we don't need to allocate our own.
        let mut old_stack = mem::zeroed();
        let r = libc::sigaltstack(ptr::null(), &mut old_stack);
        if r != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            return Ok(());
        }

        // ... but failing that we need to allocate our own, so do all that
        // here.
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let alloc = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if alloc == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        // Prepare the stack with readable/writable memory and then register
        // it with sigaltstack, leaving the guard page protected.
        let stack_ptr = (alloc as usize + guard_size) as *mut libc::c_void;
        let r = libc::mprotect(
            stack_ptr,
            SIG_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        if r != 0 {
            let err = std::io::Error::last_os_error();
            libc::munmap(alloc, alloc_size);
            return Err(Error::Io(err));
        }

        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };
        let r = libc::sigaltstack(&new_stack, ptr::null_mut());
        if r != 0 {
            let err = std::io::Error::last_os_error();
            libc::munmap(alloc, alloc_size);
            return Err(Error::Io(err));
        }

        *STACK_SAVE.lock() = Some(StackSave {
            old: (old_stack.ss_flags & libc::SS_DISABLE != 0).then_some(old_stack),
            new: new_stack,
        });

        Ok(())
    }
}

unsafe fn restore_sigaltstack() {
    let mut ssl = STACK_SAVE.lock();

    // Only restore the old stack if the current alternate stack is the one
    // installed by install_sigaltstack.
    if let Some(ss) = &mut *ssl {
        unsafe {
            let mut current_stack = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current_stack) == -1 {
                return;
            }

            if current_stack.ss_sp == ss.new.ss_sp {
                if let Some(old) = ss.old {
                    // Restore the old alt stack if there was one
                    if libc::sigaltstack(&old, ptr::null_mut()) == -1 {
                        return;
                    }
                } else {
                    // Restore to the default alt stack otherwise
                    let mut disable: libc::stack_t = mem::zeroed();
                    disable.ss_flags = libc::SS_DISABLE;
                    if libc::sigaltstack(&disable, ptr::null_mut()) == -1 {
                        return;
                    }
                }
            }

            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let alloc = (ss.new.ss_sp as usize - guard_size) as *mut libc::c_void;
            libc::munmap(alloc, guard_size + ss.new.ss_size);
            *ssl = None;
        }
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which performs the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
#[inline]
unsafe fn install_default_handler(sig: Signal) {
    unsafe { set_handler(sig, libc::SIG_DFL) };
}

unsafe fn set_handler(sig: Signal, action: usize) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the
    // handler to SIG_DFL is ignored. In that case, an infinite loop is
    // entered as the signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = action;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig as i32,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig as i32, action);
            }
        }
    }
}

static OLD_HANDLERS: parking_lot::Mutex<Option<[libc::sigaction; 6]>> =
    parking_lot::const_mutex(None);

/// Restores all of the signal handlers back to their previous values, or the
/// default if the previous value cannot be restored
unsafe fn restore_handlers() {
    let mut ohl = OLD_HANDLERS.lock();

    if let Some(old) = &*ohl {
        unsafe {
            for (sig, action) in EXCEPTION_SIGNALS.into_iter().zip(old.iter()) {
                if libc::sigaction(sig as i32, action, ptr::null_mut()) == -1 {
                    install_default_handler(sig);
                }
            }
        }
    }

    ohl.take();
}

unsafe fn install_handlers() {
    let mut ohl = OLD_HANDLERS.lock();

    if ohl.is_some() {
        return;
    }

    unsafe {
        // Store all of the current handlers so we can restore them later
        let mut old_handlers = [mem::zeroed::<libc::sigaction>(); 6];

        for (sig, handler) in EXCEPTION_SIGNALS
            .iter()
            .copied()
            .zip(old_handlers.iter_mut())
        {
            let mut old = mem::zeroed();
            if libc::sigaction(sig as i32, ptr::null(), &mut old) == -1 {
                return;
            }
            *handler = old;
        }

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all exception signals when we're handling one of them.
        for sig in EXCEPTION_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for sig in EXCEPTION_SIGNALS {
            // At this point it is impractical to back out changes, and so
            // failure to install a signal is intentionally ignored.
            let _ = libc::sigaction(sig as i32, &sa, ptr::null_mut());
        }

        *ohl = Some(old_handlers);
    }
}

/// This is the actual function installed for each signal we intercept,
/// invoked by the kernel
unsafe extern "C" fn signal_handler(
    sig: Signal,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        let info = &mut *info;

        enum Action {
            RestoreDefault,
            RestorePrevious,
        }

        let action = {
            // We might run inside a process where some other buggy code saves
            // and restores signal handlers temporarily with `signal` instead
            // of `sigaction`. This loses the `SA_SIGINFO` flag associated
            // with this function. As a consequence, the values of `info` and
            // `uc` become totally bogus, generally inducing a crash.
            //
            // The following code tries to detect this case. When it does, it
            // resets the signal handlers with `sigaction` & `SA_SIGINFO` and
            // returns. This forces the signal to be thrown again, but this
            // time the kernel will call the function with the right
            // arguments.
            {
                let mut cur_handler = mem::zeroed();
                if libc::sigaction(sig as i32, ptr::null_mut(), &mut cur_handler) == 0
                    && cur_handler.sa_sigaction == signal_handler as usize
                    && cur_handler.sa_flags & libc::SA_SIGINFO == 0
                {
                    // Reset signal handler with the correct flags.
                    libc::sigemptyset(&mut cur_handler.sa_mask);
                    libc::sigaddset(&mut cur_handler.sa_mask, sig as i32);

                    cur_handler.sa_sigaction = signal_handler as usize;
                    cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                    if libc::sigaction(sig as i32, &cur_handler, ptr::null_mut()) == -1 {
                        // When resetting the handler fails, try to reset the
                        // default one to avoid an infinite loop here.
                        install_default_handler(sig);
                    }

                    // exit the handler as we should be called again soon
                    return;
                }
            }

            let block = FAULT_BLOCK.load(Ordering::Acquire);

            if block.is_null() {
                Action::RestorePrevious
            } else {
                rendezvous(block, sig, info, uc);
                Action::RestoreDefault
            }
        };

        // Upon returning from this signal handler, sig will become unmasked
        // and then it will be retriggered. If the rendezvous ran, restore the
        // default handler so the retriggered signal performs the normal
        // unhandled-fault action. Otherwise restore the previously installed
        // handler.
        match action {
            Action::RestoreDefault => {
                debug_print!("installing default handler");
                install_default_handler(sig);
            }
            Action::RestorePrevious => {
                debug_print!("restoring handlers");
                restore_handlers();
            }
        }

        debug_print!("finishing signal handler");

        if info.si_code <= 0 || sig == Signal::Abort {
            // This signal was triggered by somebody sending us the signal
            // with kill(). In order to retrigger it, we have to queue a new
            // signal by calling kill() ourselves.
            let tid = libc::syscall(libc::SYS_gettid) as i32;
            if libc::syscall(libc::SYS_tgkill, std::process::id(), tid, sig) < 0 {
                // If we failed to kill ourselves (e.g. because a sandbox
                // disallows us to do so), we instead resort to terminating
                // our process. This will result in an incorrect exit code.
                libc::_exit(1);
            }
        } else {
            // This was a synchronous signal triggered by a hard fault
            // (e.g. SIGSEGV). No need to reissue the signal. It will
            // automatically trigger again when we return from the signal
            // handler.
        }
    }
}

/// The signal-then-wait exchange with the supervisor, raw syscalls only.
unsafe fn rendezvous(
    block: *mut FaultBlock,
    sig: Signal,
    info: &libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        if FAULT_IN_PROGRESS
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread already faulted and owns the rendezvous. Give
            // the capture the same chance to finish, then fall through to
            // termination.
            debug_print!("fault already in progress");
            wait_for_done(DUMP_DONE.load(Ordering::Relaxed));
            return;
        }

        debug_print!("recording fault");

        ptr::write_volatile(
            ptr::addr_of_mut!((*block).faulting_thread),
            libc::syscall(libc::SYS_gettid) as u32,
        );
        ptr::write_volatile(ptr::addr_of_mut!((*block).signal), sig as i32);
        ptr::write_volatile(ptr::addr_of_mut!((*block).code), info.si_code);
        ptr::write_volatile(
            ptr::addr_of_mut!((*block).fault_address),
            info.si_addr() as u64,
        );
        ptr::write_volatile(ptr::addr_of_mut!((*block).context), uc as u64);

        // Let the supervisor ptrace-read us while it captures, even under
        // restrictive yama scoping, and keep that window open until
        // dump-done.
        let _set_dumpable = SetDumpable::new();

        debug_print!("signaling dump request");

        let request = DUMP_REQUEST.load(Ordering::Relaxed);
        let increment = 1u64.to_ne_bytes();
        loop {
            let written = libc::write(request, increment.as_ptr().cast(), increment.len());
            if written != -1 || errno() != libc::EINTR {
                break;
            }
        }

        debug_print!("waiting for dump done");

        wait_for_done(DUMP_DONE.load(Ordering::Relaxed));
    }
}

/// Bounded wait for the dump-done event. A supervisor that died or stalled
/// must never keep the faulting process alive past the timeout.
unsafe fn wait_for_done(fd: RawFd) {
    if fd < 0 {
        return;
    }

    unsafe {
        let mut remaining = RENDEZVOUS_MS.load(Ordering::Relaxed).min(i32::MAX as u64) as i64;

        while remaining > 0 {
            let mut ts: libc::timespec = mem::zeroed();
            if libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) != 0 {
                return;
            }
            let started_ms = ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000;

            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            let ret = libc::poll(&mut pfd, 1, remaining.min(i32::MAX as i64) as libc::c_int);
            if ret >= 0 {
                return;
            }

            if errno() != libc::EINTR {
                return;
            }

            if libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) != 0 {
                return;
            }
            let now_ms = ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000;
            remaining -= (now_ms - started_ms).max(0);
        }
    }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// We define these constants ourselves rather than use libc as they are
/// missing from eg. Android
const PR_GET_DUMPABLE: i32 = 3;
const PR_SET_DUMPABLE: i32 = 4;
const PR_SET_PTRACER: i32 = 0x5961_6d61;
const PR_SET_PTRACER_ANY: i32 = -1;

/// Helper that sets the process as dumpable if it is not, and when dropped
/// returns it back to the original state if needed
struct SetDumpable {
    was_dumpable: bool,
}

impl SetDumpable {
    unsafe fn new() -> Self {
        unsafe {
            let is_dumpable = libc::syscall(libc::SYS_prctl, PR_GET_DUMPABLE, 0, 0, 0, 0);
            let was_dumpable = is_dumpable > 0;

            if !was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            // We do not know the supervisor's pid here, so allow any process,
            // which _somewhat_ defeats the purpose of the yama security that
            // this call is needed for. We only need to do this if
            // `/proc/sys/kernel/yama/ptrace_scope` = 1, but it should not
            // have a negative impact in any other mode.
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0);

            Self { was_dumpable }
        }
    }
}

impl Drop for SetDumpable {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, 0, 0, 0, 0);

            if !self.was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 0, 0, 0, 0);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::FaultBlock;

    #[test]
    fn block_bytes() {
        assert_eq!(std::mem::size_of::<FaultBlock>(), 40);

        let mut expected = FaultBlock::new(4242);
        expected.faulting_thread = 4545;
        expected.signal = libc::SIGSEGV;
        expected.fault_address = 0xffff_8800_0000_0000;

        let actual = FaultBlock::from_bytes(expected.as_bytes()).unwrap();

        assert_eq!(expected, actual);
    }
}
