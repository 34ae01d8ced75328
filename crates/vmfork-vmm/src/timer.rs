//! Per-vCPU execution timeouts.
//!
//! Each vCPU owns a POSIX interval timer created on the thread that runs
//! it (`SIGEV_THREAD_ID`), delivering `SIGUSR2` to exactly that thread.
//! The signal interrupts a blocking `KVM_RUN` with `EINTR`.  Because the
//! signal can also land between exits — after the ioctl returned but
//! before the next re-entry — the handler additionally sets a
//! thread-local flag which the run loop re-checks after every exit.  Both
//! observations raise the timeout; neither alone is sufficient.
//!
//! After the initial deadline the timer keeps firing every
//! [`RECURRING_INTERVAL_MS`] until disarmed, so a handler stuck in a
//! blocking host call is eventually interrupted too.  Disarming is tied
//! to a guard value ([`TimerGuard`]) so that every exit path out of the
//! run loop, including error paths, rewinds the timer.

use crate::error::{MachineError, Result};
use std::cell::Cell;
use std::io;
use std::sync::Once;

/// Recurring re-fire interval once the deadline has passed.
pub const RECURRING_INTERVAL_MS: u64 = 20;

thread_local! {
    static TIMER_FIRED: Cell<bool> = const { Cell::new(false) };
}

/// The signal handler performs only a thread-local store.  The machine is
/// never migrated while it is running, so the flag is always read by the
/// thread that armed the timer.
extern "C" fn timeout_signal_handler(sig: libc::c_int) {
    if sig == libc::SIGUSR2 {
        TIMER_FIRED.with(|f| f.set(true));
    }
}

/// Install the process-wide `SIGUSR2` handler.  Idempotent; called during
/// machine construction.  `SA_RESTART` is deliberately absent: `KVM_RUN`
/// must come back with `EINTR`.
pub fn install_signal_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // SAFETY: installing a handler that only writes a thread-local.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = timeout_signal_handler as *const () as usize;
            sa.sa_flags = 0;
            libc::sigaction(libc::SIGUSR2, &sa, std::ptr::null_mut());
        }
    });
}

/// Clear the thread-local timeout flag (start of a run).
pub fn clear_fired() {
    TIMER_FIRED.with(|f| f.set(false));
}

/// Whether the timeout signal has fired on this thread since the last
/// [`clear_fired`].
pub fn fired() -> bool {
    TIMER_FIRED.with(|f| f.get())
}

/// One vCPU's interval timer, bound to the thread that created it.
///
/// Moving the owning machine to another thread requires re-creating the
/// timer there (`Machine::migrate_to_this_thread`); a timer left behind
/// would signal a thread that no longer runs the vCPU.
pub struct VcpuTimer {
    id: libc::timer_t,
}

// SAFETY: timer_t is an opaque kernel handle; all operations on it are
// thread-safe syscalls.  Signal *delivery* stays pinned to the creating
// thread, which is the documented migration contract above.
unsafe impl Send for VcpuTimer {}

impl VcpuTimer {
    /// Create a timer delivering `SIGUSR2` to the calling thread.
    pub fn new() -> Result<Self> {
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = libc::SIGUSR2;
        // SAFETY: gettid has no preconditions.
        sev.sigev_notify_thread_id = unsafe { libc::gettid() };

        let mut id: libc::timer_t = std::ptr::null_mut();
        // SAFETY: sev and id point to valid, initialized storage.
        let rc = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut id) };
        if rc != 0 {
            return Err(MachineError::TimerCreate(io::Error::last_os_error()));
        }
        Ok(Self { id })
    }

    /// Arm the timer: first expiry after `millis`, then every
    /// [`RECURRING_INTERVAL_MS`] until the guard disarms it.
    ///
    /// `millis == 0` returns an unarmed guard (no timeout).
    pub fn arm(&self, millis: u32) -> TimerGuard {
        clear_fired();
        if millis == 0 {
            return TimerGuard {
                id: self.id,
                armed: false,
            };
        }
        let its = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: (RECURRING_INTERVAL_MS * 1_000_000) as _,
            },
            it_value: libc::timespec {
                tv_sec: (millis / 1000) as _,
                tv_nsec: ((millis % 1000) as u64 * 1_000_000) as _,
            },
        };
        // SAFETY: self.id is a live timer owned by this struct.
        unsafe {
            libc::timer_settime(self.id, 0, &its, std::ptr::null_mut());
        }
        TimerGuard {
            id: self.id,
            armed: true,
        }
    }
}

impl Drop for VcpuTimer {
    fn drop(&mut self) {
        // SAFETY: deleting the timer this struct owns.
        unsafe {
            libc::timer_delete(self.id);
        }
    }
}

/// Scoped arming of a [`VcpuTimer`]: dropping the guard disarms the timer
/// and clears the thread-local flag, on success and error paths alike.
pub struct TimerGuard {
    id: libc::timer_t,
    armed: bool,
}

impl TimerGuard {
    /// Whether a deadline is currently armed.
    #[inline]
    pub fn armed(&self) -> bool {
        self.armed
    }

    fn disarm(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let its: libc::itimerspec = unsafe { std::mem::zeroed() };
        // SAFETY: a zeroed itimerspec disarms the live timer.
        unsafe {
            libc::timer_settime(self.id, 0, &its, std::ptr::null_mut());
        }
        clear_fired();
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn armed_timer_sets_the_flag() {
        install_signal_handler();
        let timer = VcpuTimer::new().unwrap();
        let guard = timer.arm(5);
        assert!(guard.armed());
        std::thread::sleep(Duration::from_millis(100));
        assert!(fired());
        drop(guard);
        assert!(!fired(), "guard drop must clear the flag");
    }

    #[test]
    fn zero_timeout_never_fires() {
        install_signal_handler();
        let timer = VcpuTimer::new().unwrap();
        let guard = timer.arm(0);
        assert!(!guard.armed());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!fired());
    }

    #[test]
    fn dropping_the_guard_disarms() {
        install_signal_handler();
        let timer = VcpuTimer::new().unwrap();
        drop(timer.arm(10));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!fired());
    }

    #[test]
    fn timers_are_per_thread() {
        install_signal_handler();
        let handle = std::thread::spawn(|| {
            let timer = VcpuTimer::new().unwrap();
            let _guard = timer.arm(5);
            std::thread::sleep(Duration::from_millis(80));
            fired()
        });
        assert!(handle.join().unwrap());
        // This thread's flag is untouched.
        assert!(!fired());
    }
}
